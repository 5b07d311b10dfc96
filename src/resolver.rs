//! The query interface, which finds endpoints for a service.

use crate::cache::ServiceCache;
use crate::config::Config;
use crate::endpoint::{CopyId, Endpoint, Processor};
use crate::parser::Parser;
use crate::schema::{self, SchemaVersion};
use crate::service;
use crate::snapshot::Snapshot;
use crate::store::{self, SharedStore};
use crate::watcher::WatchWorker;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid service location: {0:?}")]
    InvalidLocation(service::Location),

    #[error("Invalid base prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("Cannot connect to the store")]
    Store(#[from] store::Error),
}

/// Resolves a service location into endpoints.
///
/// Creating a resolver detects which directory layout the service uses, and
/// starts a background task which follows that directory for as long as the
/// resolver exists. Lookups never touch the store: they are answered from the
/// most recent [Snapshot], which may lag slightly behind the store.
///
/// If the store becomes unreachable, the last snapshot read keeps being
/// served until the connection recovers.
#[derive(Debug)]
pub struct Resolver {
    location: service::Location,
    path: Arc<str>,
    version: SchemaVersion,
    cache: Arc<ServiceCache>,
    handle: Option<JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl Resolver {
    /// Creates a new resolver for a service.
    ///
    /// - `store`: Where services register themselves.
    /// - `location`: The service to resolve, relative to the schema
    ///   directory (e.g. `"base/account"`).
    /// - `config`: Additional tweakable configuration options.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// ```no_run
    /// use servmap::config::Config;
    /// use servmap::stores::memory::MemoryStore;
    /// use servmap::Resolver;
    /// use std::sync::Arc;
    ///
    /// # async {
    /// let store = Arc::new(MemoryStore::new());
    /// let resolver = Resolver::new(store, "base/account", Config::default())
    ///     .await
    ///     .unwrap();
    ///
    /// if let Some(endpoint) = resolver.pick_by_hash("proc_thrift", "user-42") {
    ///     println!("Sending to {}", endpoint.addr);
    /// }
    /// # };
    /// ```
    pub async fn new(
        store: SharedStore,
        location: impl Into<service::Location>,
        config: Config,
    ) -> Result<Self, Error> {
        let location = location.into();
        if !location.is_valid() {
            return Err(Error::InvalidLocation(location));
        }
        if !config.prefix_is_valid() {
            return Err(Error::InvalidPrefix(config.base_prefix));
        }

        #[cfg(feature = "probes")]
        if let Err(err) = usdt::register_probes() {
            event!(Level::WARN, ?err, "Failed to register USDT probes");
        }

        let version = schema::probe(store.as_ref(), &config.base_prefix, &location).await;
        let path: Arc<str> = version.path(&config.base_prefix, &location).into();
        event!(Level::INFO, %location, %version, %path, "Created resolver");

        let cache = Arc::new(ServiceCache::new());
        let worker = WatchWorker::new(
            store,
            path.clone(),
            Parser::from(version),
            cache.clone(),
            &config,
        );
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::task::spawn(worker.run(terminate_rx));

        Ok(Self {
            location,
            path,
            version,
            cache,
            handle: Some(handle),
            terminate_tx: Some(terminate_tx),
        })
    }

    /// Creates a resolver which reads from etcd.
    ///
    /// Fails if the etcd client cannot be created from `etcd`.
    #[cfg(feature = "etcd")]
    pub async fn etcd(
        etcd: crate::stores::etcd::EtcdConfig,
        location: impl Into<service::Location>,
        config: Config,
    ) -> Result<Self, Error> {
        let store = crate::stores::etcd::EtcdStore::new(etcd)?;
        Self::new(Arc::new(store), location, config).await
    }

    /// Picks an endpoint of `processor`, spreading keys across copies.
    ///
    /// For an unchanged set of copies, the same key always maps to the same
    /// endpoint. When copies come or go, most keys may move.
    pub fn pick_by_hash(&self, processor: &str, key: &str) -> Option<Endpoint> {
        self.cache
            .read(|snapshot| snapshot.pick_by_hash(processor, key).cloned())
    }

    /// Picks the endpoint of `processor` within one specific copy.
    pub fn pick_by_copy(&self, id: CopyId, processor: &str) -> Option<Endpoint> {
        self.cache
            .read(|snapshot| snapshot.pick_by_copy(id, processor).cloned())
    }

    /// Returns every endpoint of every processor, ordered by copy id.
    ///
    /// The result is a copy, and does not follow later updates.
    pub fn all_endpoints(&self) -> BTreeMap<Processor, Vec<Endpoint>> {
        self.cache.read(|snapshot| snapshot.processors().clone())
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.current()
    }

    /// Returns a receiver to track snapshot updates.
    pub fn monitor(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.cache.subscribe()
    }

    /// The service this resolver was created for.
    pub fn location(&self) -> &service::Location {
        &self.location
    }

    /// The directory being followed, including prefix and schema segment.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Stops following the store.
    ///
    /// Lookups keep answering from the last snapshot. If the background task
    /// panicked, the panic is propagated.
    pub async fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Some(terminate_tx) = self.terminate_tx.take() else {
            return;
        };

        let _send_result = terminate_tx.send(());
        if let Err(err) = handle.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}
