//! Implementation of [Store] for the etcd v2 keys API.

use crate::store::{BoxedWatcher, Error, Node, Response, Store, Watcher};

use anyhow::anyhow;
use async_trait::async_trait;
use debug_ignore::DebugIgnore;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, instrument, Level};

// The store-wide index at the time a response was produced.
const INDEX_HEADER: &str = "X-Etcd-Index";

const ERROR_KEY_NOT_FOUND: u64 = 100;

/// How to reach an etcd cluster.
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    /// Base URLs of cluster members, e.g. `"http://127.0.0.1:2379"`.
    ///
    /// Requests go to the last member which answered, moving on to the
    /// others in order when it stops answering.
    ///
    /// Default: `["http://127.0.0.1:2379"]`
    pub endpoints: Vec<String>,

    /// Username for basic authentication, if the cluster requires it.
    ///
    /// Default: None
    pub username: Option<String>,

    /// Password for basic authentication.
    ///
    /// Default: None
    pub password: Option<DebugIgnore<String>>,

    /// Time limit for reads. Does not apply to watches, which wait for as
    /// long as it takes for something to change.
    ///
    /// Default: 5 seconds
    pub request_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Inner {
    client: reqwest::Client,
    endpoints: Vec<String>,
    username: Option<String>,
    password: Option<DebugIgnore<String>>,
    request_timeout: Duration,

    // Index into "endpoints" of the member which last answered.
    preferred: AtomicUsize,
}

/// A [Store] backed by an etcd cluster, spoken to over HTTP.
#[derive(Clone, Debug)]
pub struct EtcdStore {
    inner: Arc<Inner>,
}

impl EtcdStore {
    pub fn new(config: EtcdConfig) -> Result<Self, Error> {
        if config.endpoints.is_empty() {
            return Err(Error::Other(anyhow!("No etcd endpoints configured")));
        }
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let endpoint = endpoint.trim_end_matches('/');
                reqwest::Url::parse(endpoint).map_err(|err| {
                    Error::Other(anyhow!(err).context(format!("Invalid etcd endpoint {endpoint:?}")))
                })?;
                Ok(endpoint.to_string())
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::Other(err.into()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoints,
                username: config.username,
                password: config.password,
                request_timeout: config.request_timeout,
                preferred: AtomicUsize::new(0),
            }),
        })
    }

    // Sends a request for "path" to each member in turn, until one answers.
    //
    // Only failing to reach a member moves on to the next one; any answer,
    // including an error from etcd, is final.
    async fn request(
        &self,
        path: &str,
        query: &[(&'static str, String)],
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        let count = inner.endpoints.len();
        let first = inner.preferred.load(Ordering::Relaxed);

        for offset in 0..count {
            let i = (first + offset) % count;
            let endpoint = &inner.endpoints[i];

            let mut request = inner
                .client
                .get(format!("{endpoint}/v2/keys{path}"))
                .query(query);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(username) = &inner.username {
                request = request.basic_auth(
                    username,
                    inner.password.as_ref().map(|password| password.as_str()),
                );
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    event!(Level::WARN, %endpoint, ?err, "Failed to reach etcd member");
                    continue;
                }
            };
            inner.preferred.store(i, Ordering::Relaxed);

            let status = response.status();
            let index = response
                .headers()
                .get(INDEX_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            let body = response
                .bytes()
                .await
                .map_err(|err| Error::Other(err.into()))?;
            return interpret(status, index, &body);
        }

        event!(Level::ERROR, count, "No etcd member reachable");
        Err(Error::Unavailable)
    }
}

fn read_query(recursive: bool) -> Vec<(&'static str, String)> {
    vec![("recursive", recursive.to_string())]
}

fn watch_query(recursive: bool, wait_index: u64) -> Vec<(&'static str, String)> {
    let mut query = vec![("wait", "true".to_string())];
    query.extend(read_query(recursive));
    query.push(("waitIndex", wait_index.to_string()));
    query
}

#[derive(Deserialize)]
struct SuccessBody {
    action: String,
    node: Node,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

// Maps an HTTP response from the keys API into a [Response].
fn interpret(status: StatusCode, index: Option<u64>, body: &[u8]) -> Result<Response, Error> {
    if status.is_success() {
        let SuccessBody { action, node } = serde_json::from_slice(body)?;
        let index = index.unwrap_or(node.modified_index);
        return Ok(Response {
            action,
            index,
            node,
        });
    }

    let Ok(err) = serde_json::from_slice::<ErrorBody>(body) else {
        return Err(Error::Other(anyhow!("Unexpected status from etcd: {status}")));
    };
    match err.error_code {
        ERROR_KEY_NOT_FOUND => Err(Error::NotFound {
            key: err.cause.unwrap_or_default(),
        }),
        code => Err(Error::Other(anyhow!(
            "etcd error {code}: {} ({})",
            err.message,
            err.cause.unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl Store for EtcdStore {
    #[instrument(skip(self), name = "EtcdStore::get")]
    async fn get(&self, path: &str, recursive: bool) -> Result<Response, Error> {
        self.request(path, &read_query(recursive), Some(self.inner.request_timeout))
            .await
    }

    fn watch(&self, path: &str, recursive: bool, after_index: u64) -> BoxedWatcher {
        Box::new(EtcdWatcher::new(self.clone(), path, recursive, after_index))
    }
}

/// Long-polls etcd for changes, one change per request.
struct EtcdWatcher {
    store: EtcdStore,
    path: String,
    recursive: bool,

    // The index of the next change we want to hear about. etcd answers
    // immediately if that change already happened.
    wait_index: u64,
}

impl EtcdWatcher {
    fn new(store: EtcdStore, path: &str, recursive: bool, after_index: u64) -> Self {
        Self {
            store,
            path: path.to_string(),
            recursive,
            wait_index: after_index + 1,
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        watch_query(self.recursive, self.wait_index)
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<Response, Error> {
        // If we fell so far behind that etcd no longer remembers
        // "wait_index", this fails, and the caller starts over.
        let response = self.store.request(&self.path, &self.query(), None).await?;
        self.wait_index = response.node.modified_index + 1;
        Ok(response)
    }
}
