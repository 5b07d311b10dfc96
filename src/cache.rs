//! Holds the single current snapshot of a service.

use crate::snapshot::Snapshot;

use std::sync::Arc;
use tokio::sync::watch;

/// A single-slot holder for the latest [Snapshot].
///
/// Publishing swaps the whole snapshot at once, so readers see either the
/// old snapshot or the new one, never a mix. Readers hold the slot's lock
/// only while they copy out what they need.
#[derive(Debug)]
pub(crate) struct ServiceCache {
    tx: watch::Sender<Arc<Snapshot>>,
}

impl ServiceCache {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx }
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Returns the current snapshot, which will not change underneath the
    /// caller.
    pub(crate) fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Runs `f` against the current snapshot.
    ///
    /// `f` must not block: the slot is locked for as long as it runs.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        f(&self.tx.borrow())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::endpoint::CopyId;
    use crate::snapshot::CopyRecord;
    use crate::test_utils::registration;

    // Every processor of every copy points at the same host.
    fn uniform_snapshot(host: &str) -> Snapshot {
        Snapshot::new((0..8).map(|id| {
            CopyRecord::new(
                CopyId(id),
                registration(&[("a", host), ("b", host), ("c", host)]),
            )
        }))
    }

    #[test]
    fn publish_replaces_snapshot() {
        let cache = ServiceCache::new();
        assert!(cache.current().is_empty());

        let held = cache.current();
        cache.publish(uniform_snapshot("one:1"));
        // Snapshots handed out earlier are unaffected.
        assert!(held.is_empty());
        assert_eq!(cache.current().endpoints("a").len(), 8);
        assert_eq!(cache.read(|s| s.copies().len()), 8);
    }

    #[test]
    fn subscribers_see_publishes() {
        let cache = ServiceCache::new();
        let mut rx = cache.subscribe();
        assert!(!rx.has_changed().unwrap());
        cache.publish(uniform_snapshot("one:1"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().copies().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_mixed_snapshots() {
        let cache = Arc::new(ServiceCache::new());
        cache.publish(uniform_snapshot("old:1"));

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..2000 {
                    let host = if i % 2 == 0 { "new:1" } else { "old:1" };
                    cache.publish(uniform_snapshot(host));
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..2000 {
                        let all = cache.read(|s| s.processors().clone());
                        let mut addrs = all.values().flatten().map(|e| e.addr.clone());
                        let first = addrs.next().unwrap();
                        assert!(addrs.all(|addr| addr == first), "mixed snapshot");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
