//! Follows a service directory in the store, keeping a [ServiceCache] current.

use crate::backoff::Backoff;
use crate::cache::ServiceCache;
use crate::config::Config;
use crate::parser::Parser;
#[cfg(feature = "probes")]
use crate::probes;
use crate::snapshot::Snapshot;
use crate::store::{self, Response, SharedStore, Store};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

// Attempts hand over one change at a time; the coordinator re-reads the
// whole directory for each, so there is no point queueing more.
const CHANGE_BUFFER: usize = 1;

// One fetch-then-watch attempt against the store.
//
// The attempt reports the initial read, and then every change notification,
// through "rx". The channel closes when the attempt fails; the attempt never
// recovers by itself.
struct Attempt {
    rx: mpsc::Receiver<Response>,
    handle: JoinHandle<()>,
}

impl Attempt {
    fn start(store: SharedStore, path: Arc<str>) -> Self {
        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        let handle = tokio::task::spawn(async move {
            #[cfg(feature = "probes")]
            probes::watch__start!(|| path.as_ref());

            let Some(err) = follow(store.as_ref(), &path, &tx).await else {
                // The coordinator went away.
                return;
            };
            event!(Level::WARN, path = %path, ?err, "Stopped following directory");

            #[cfg(feature = "probes")]
            probes::watch__failed!(|| (path.as_ref(), err.to_string()));
        });
        Self { rx, handle }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// Reads the directory, then watches it, forwarding everything to "tx".
//
// Returns the error which ended the attempt, or "None" if "tx" was closed.
async fn follow(
    store: &dyn Store,
    path: &str,
    tx: &mpsc::Sender<Response>,
) -> Option<store::Error> {
    let initial = match store.get(path, true).await {
        Ok(initial) => initial,
        Err(err) => return Some(err),
    };
    event!(
        Level::INFO,
        path,
        index = initial.index,
        nodes = initial.node.nodes.len(),
        "Fetched directory"
    );

    // Watch from the index of the initial read: the coordinator's re-read
    // happens later, so anything it could miss is still reported.
    let mut watcher = store.watch(path, true, initial.index);
    tx.send(initial).await.ok()?;

    loop {
        match watcher.next().await {
            Ok(change) => {
                event!(
                    Level::DEBUG,
                    path,
                    action = %change.action,
                    key = %change.node.key,
                    index = change.index,
                    "Observed change"
                );
                tx.send(change).await.ok()?;
            }
            Err(err) => return Some(err),
        }
    }
}

/// Keeps the cache in sync with one directory of the store.
///
/// This is the only writer of the cache. Every signal from the store,
/// including the initial read, triggers a full re-read of the directory
/// rather than an incremental update: watches may miss changes across
/// reconnects, and a missed change would otherwise never be repaired.
pub(crate) struct WatchWorker {
    store: SharedStore,
    path: Arc<str>,
    parser: Parser,
    cache: Arc<ServiceCache>,
    backoff: Backoff,
}

impl WatchWorker {
    pub(crate) fn new(
        store: SharedStore,
        path: Arc<str>,
        parser: Parser,
        cache: Arc<ServiceCache>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            path,
            parser,
            cache,
            backoff: Backoff::new(
                config.min_backoff,
                config.max_backoff,
                config.backoff_spread,
            ),
        }
    }

    #[instrument(skip_all, fields(path = %self.path), name = "WatchWorker::run")]
    pub(crate) async fn run(mut self, mut terminate_rx: oneshot::Receiver<()>) {
        event!(Level::INFO, parser = ?self.parser, "Starting to follow directory");
        let mut attempt = None;
        loop {
            tokio::select! {
                _ = &mut terminate_rx => {
                    event!(Level::INFO, "Terminating");
                    return;
                },
                _ = self.step(&mut attempt) => {},
            }
        }
    }

    // Waits for the next signal from the current attempt, starting a new one
    // if none is running.
    async fn step(&mut self, attempt: &mut Option<Attempt>) {
        let current = attempt
            .get_or_insert_with(|| Attempt::start(self.store.clone(), self.path.clone()));

        match current.rx.recv().await {
            Some(change) => {
                event!(
                    Level::INFO,
                    action = %change.action,
                    key = %change.node.key,
                    "Directory changed; re-reading"
                );
                self.refresh().await;
                self.backoff.reset();
            }
            None => {
                *attempt = None;
                let delay = self.backoff.current();
                event!(Level::WARN, ?delay, "Lost the store; reconnecting after backoff");

                #[cfg(feature = "probes")]
                probes::backoff!(|| (self.path.as_ref(), delay.as_millis() as u64));

                self.backoff.wait().await;
            }
        }
    }

    // Re-reads the whole directory and publishes what it holds.
    //
    // A directory which no longer exists holds no copies. On any other
    // failure, the previous snapshot stays in place.
    async fn refresh(&self) {
        let response = match self.store.get(&self.path, true).await {
            Ok(response) => response,
            Err(store::Error::NotFound { key }) => {
                event!(Level::WARN, %key, "Directory is gone; publishing empty snapshot");
                self.cache.publish(Snapshot::default());

                #[cfg(feature = "probes")]
                probes::refresh__done!(|| (self.path.as_ref(), 0u64));
                return;
            }
            Err(err) => {
                event!(Level::ERROR, ?err, "Failed to re-read directory");
                #[cfg(feature = "probes")]
                probes::refresh__failed!(|| (self.path.as_ref(), err.to_string()));
                return;
            }
        };

        match self.parser.parse(&response.node) {
            Ok(snapshot) => {
                let copies = snapshot.copies().len();
                event!(
                    Level::INFO,
                    index = response.index,
                    copies,
                    processors = snapshot.processors().len(),
                    "Publishing snapshot"
                );
                self.cache.publish(snapshot);

                #[cfg(feature = "probes")]
                probes::refresh__done!(|| (self.path.as_ref(), copies as u64));
            }
            Err(err) => {
                event!(Level::ERROR, %err, "Failed to parse directory");
                #[cfg(feature = "probes")]
                probes::refresh__failed!(|| (self.path.as_ref(), err.to_string()));
            }
        }
    }
}
