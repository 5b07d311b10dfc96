use clap::Parser;
use futures::StreamExt;
use servmap::config::Config;
use servmap::stores::etcd::EtcdConfig;
use servmap::Resolver;
use tokio_stream::wrappers::WatchStream;
use tracing::{event, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// etcd member to read from. May be repeated.
    #[clap(long, short = 'e', default_value = "http://127.0.0.1:2379")]
    pub endpoint: Vec<http::Uri>,

    /// Directory which holds every service's registrations
    #[clap(long, short = 'p', default_value = servmap::config::DEFAULT_BASE_PREFIX)]
    pub prefix: String,

    /// Processor to pick an endpoint of, on every update
    #[clap(long, requires = "key")]
    pub processor: Option<String>,

    /// Key to hash when picking an endpoint of `--processor`
    #[clap(long, requires = "processor")]
    pub key: Option<String>,

    /// Service to follow, e.g. "base/account"
    pub location: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Args = Args::parse();
    let etcd = EtcdConfig {
        endpoints: args
            .endpoint
            .iter()
            .map(|uri| uri.to_string())
            .collect(),
        ..Default::default()
    };
    let config = Config {
        base_prefix: args.prefix.clone(),
        ..Default::default()
    };

    let mut resolver = Resolver::etcd(etcd, args.location.as_str(), config).await?;
    event!(
        Level::INFO,
        path = resolver.path(),
        version = %resolver.version(),
        "Following service; Ctrl-C to stop"
    );

    let mut updates = WatchStream::new(resolver.monitor());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(snapshot) = updates.next() => {
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
                if let (Some(processor), Some(key)) = (&args.processor, &args.key) {
                    match resolver.pick_by_hash(processor, key) {
                        Some(endpoint) => println!("{processor}[{key}] -> {}", endpoint.addr),
                        None => println!("{processor}[{key}] -> (none)"),
                    }
                }
            }
        }
    }

    event!(Level::INFO, "Stopping");
    resolver.terminate().await;
    Ok(())
}
