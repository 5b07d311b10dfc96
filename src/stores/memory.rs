//! Implementation of [Store] which keeps the whole tree in process memory.
//!
//! This is useful for tests and demos, and for embedding servmap in programs
//! which manage registrations themselves.

use crate::store::{BoxedWatcher, Error, Node, Response, Store, Watcher};

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{event, Level};

// How many unobserved changes a watcher may fall behind by before its watch
// is broken.
const CHANGE_BUFFER: usize = 256;

// How many past changes are kept for watches which start from an earlier
// index.
const HISTORY_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
struct Entry {
    // "None" for directories.
    value: Option<String>,
    modified_index: u64,
}

#[derive(Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    index: u64,

    // The most recent changes, oldest first.
    history: VecDeque<Response>,
}

impl Tree {
    fn node(&self, key: &str, entry: &Entry, recursive: bool, top: bool) -> Node {
        let Some(value) = &entry.value else {
            let nodes = if top || recursive {
                self.children(key)
                    .map(|(child_key, child)| self.node(child_key, child, recursive, false))
                    .collect()
            } else {
                vec![]
            };
            return Node {
                key: key.to_string(),
                dir: true,
                value: None,
                nodes,
                modified_index: entry.modified_index,
            };
        };
        Node {
            key: key.to_string(),
            dir: false,
            value: Some(value.clone()),
            nodes: vec![],
            modified_index: entry.modified_index,
        }
    }

    fn children(&self, key: &str) -> impl Iterator<Item = (&String, &Entry)> + '_ {
        let prefix = format!("{key}/");
        let skip = prefix.len();
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| !k[skip..].contains('/'))
    }

    // Creates every missing ancestor directory of "key", as of "index".
    //
    // Nothing is created if an ancestor turns out to be a leaf.
    fn make_parents(&mut self, key: &str, index: u64) -> Result<(), Error> {
        let mut end = 0;
        while let Some(offset) = key[end + 1..].find('/') {
            end += offset + 1;
            let parent = &key[..end];
            match self.entries.get(parent) {
                Some(Entry { value: Some(_), .. }) => {
                    return Err(Error::Other(anyhow::anyhow!("Not a directory: {parent}")));
                }
                Some(_) => (),
                None => {
                    self.entries.insert(
                        parent.to_string(),
                        Entry {
                            value: None,
                            modified_index: index,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

// Keys are absolute, and never end in a separator.
fn normalize(key: &str) -> String {
    let key = key.trim_end_matches('/');
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Connectivity {
    online: bool,
    // Bumped whenever the store goes offline, breaking existing watches.
    epoch: u64,
}

struct Inner {
    tree: Mutex<Tree>,
    changes: broadcast::Sender<Response>,
    connectivity: watch::Sender<Connectivity>,
    reads: AtomicUsize,
}

/// A [`Store`] which holds its directory tree in memory.
///
/// Clones share the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (connectivity, _) = watch::channel(Connectivity {
            online: true,
            epoch: 0,
        });
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::default()),
                changes,
                connectivity,
                reads: AtomicUsize::new(0),
            }),
        }
    }

    /// Sets the value of a leaf, creating parent directories as needed.
    pub fn set(&self, key: &str, value: impl ToString) -> Result<(), Error> {
        let key = normalize(key);
        let mut tree = self.inner.tree.lock().unwrap();
        if matches!(tree.entries.get(&key), Some(Entry { value: None, .. })) {
            return Err(Error::Other(anyhow::anyhow!("Not a file: {key}")));
        }
        let index = tree.index + 1;
        tree.make_parents(&key, index)?;
        tree.index = index;

        let entry = Entry {
            value: Some(value.to_string()),
            modified_index: index,
        };
        tree.entries.insert(key.clone(), entry.clone());
        let response = Response {
            action: "set".to_string(),
            index,
            node: tree.node(&key, &entry, false, true),
        };
        self.notify(&mut tree, response);
        Ok(())
    }

    /// Creates a directory, and any missing parents.
    pub fn mkdir(&self, key: &str) -> Result<(), Error> {
        let key = normalize(key);
        let mut tree = self.inner.tree.lock().unwrap();
        if let Some(entry) = tree.entries.get(&key) {
            if entry.value.is_none() {
                return Ok(());
            }
            return Err(Error::Other(anyhow::anyhow!("Not a directory: {key}")));
        }
        let index = tree.index + 1;
        tree.make_parents(&key, index)?;
        tree.index = index;

        tree.entries.insert(
            key.clone(),
            Entry {
                value: None,
                modified_index: index,
            },
        );
        let response = Response {
            action: "create".to_string(),
            index,
            node: Node::dir(&key, vec![]),
        };
        self.notify(&mut tree, response);
        Ok(())
    }

    /// Removes a key, and everything below it.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        let key = normalize(key);
        let mut tree = self.inner.tree.lock().unwrap();
        let Some(removed) = tree.entries.remove(&key) else {
            return Err(Error::NotFound { key });
        };
        let prefix = format!("{key}/");
        tree.entries.retain(|k, _| !k.starts_with(&prefix));
        tree.index += 1;

        let response = Response {
            action: "delete".to_string(),
            index: tree.index,
            node: Node {
                key,
                dir: removed.value.is_none(),
                modified_index: tree.index,
                ..Default::default()
            },
        };
        self.notify(&mut tree, response);
        Ok(())
    }

    /// Simulates losing (or regaining) connectivity to the store.
    ///
    /// While offline, reads fail and watchers report errors. Going offline
    /// also breaks every watch that was started earlier, even if the store
    /// comes back before the watcher next polls.
    pub fn set_online(&self, online: bool) {
        event!(Level::DEBUG, online, "MemoryStore connectivity changed");
        self.inner.connectivity.send_modify(|c| {
            if c.online && !online {
                c.epoch += 1;
            }
            c.online = online;
        });
    }

    /// How many reads have been served (or refused) so far.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// The index of the most recent change.
    pub fn index(&self) -> u64 {
        self.inner.tree.lock().unwrap().index
    }

    // Records a change and tells watchers about it. Called with the tree
    // locked, so that watchers see changes in index order.
    fn notify(&self, tree: &mut Tree, response: Response) {
        event!(Level::TRACE, key = %response.node.key, action = %response.action, "MemoryStore change");
        if tree.history.len() == HISTORY_LIMIT {
            tree.history.pop_front();
        }
        tree.history.push_back(response.clone());
        // No receivers is fine: nobody is watching.
        let _ = self.inner.changes.send(response);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str, recursive: bool) -> Result<Response, Error> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if !self.inner.connectivity.borrow().online {
            return Err(Error::Unavailable);
        }
        let key = normalize(path);
        let tree = self.inner.tree.lock().unwrap();
        let Some(entry) = tree.entries.get(&key) else {
            return Err(Error::NotFound { key });
        };
        Ok(Response {
            action: "get".to_string(),
            index: tree.index,
            node: tree.node(&key, entry, recursive, true),
        })
    }

    fn watch(&self, path: &str, recursive: bool, after_index: u64) -> BoxedWatcher {
        let connectivity = self.inner.connectivity.subscribe();
        let current = *connectivity.borrow();
        // A watch started while offline never delivers anything.
        let epoch = current.online.then_some(current.epoch);

        // Subscribe and copy the history under the same lock, so that every
        // change is seen exactly once.
        let tree = self.inner.tree.lock().unwrap();
        let changes = BroadcastStream::new(self.inner.changes.subscribe());
        let oldest = tree
            .history
            .front()
            .map_or(tree.index + 1, |response| response.index);
        let backlog = (after_index + 1 >= oldest).then(|| {
            tree.history
                .iter()
                .filter(|response| response.index > after_index)
                .cloned()
                .collect()
        });

        Box::new(MemoryWatcher {
            key: normalize(path),
            recursive,
            after_index,
            backlog,
            epoch,
            connectivity,
            changes,
        })
    }
}

struct MemoryWatcher {
    key: String,
    recursive: bool,
    after_index: u64,
    // Past changes still to be reported. "None" if the history no longer
    // reaches back to "after_index".
    backlog: Option<VecDeque<Response>>,
    epoch: Option<u64>,
    connectivity: watch::Receiver<Connectivity>,
    changes: BroadcastStream<Response>,
}

// Whether a watch on "key" should report "change".
fn observes(key: &str, recursive: bool, change: &Response) -> bool {
    let changed = change.node.key.as_str();
    if changed == key {
        return true;
    }
    // Removing a directory removes everything below it.
    if change.action == "delete" && is_below(key, changed) {
        return true;
    }
    recursive && is_below(changed, key)
}

fn is_below(key: &str, ancestor: &str) -> bool {
    key.len() > ancestor.len()
        && key.starts_with(ancestor)
        && key.as_bytes()[ancestor.len()] == b'/'
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Response, Error> {
        loop {
            let connectivity = *self.connectivity.borrow_and_update();
            if !connectivity.online || Some(connectivity.epoch) != self.epoch {
                return Err(Error::Unavailable);
            }

            let Some(backlog) = self.backlog.as_mut() else {
                return Err(Error::Other(anyhow::anyhow!(
                    "Changes after index {} are no longer available",
                    self.after_index
                )));
            };
            while let Some(response) = backlog.pop_front() {
                if observes(&self.key, self.recursive, &response) {
                    return Ok(response);
                }
            }

            tokio::select! {
                result = self.connectivity.changed() => {
                    if result.is_err() {
                        return Err(Error::WatchClosed);
                    }
                }
                change = self.changes.next() => match change {
                    Some(Ok(response)) => {
                        if observes(&self.key, self.recursive, &response) {
                            return Ok(response);
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        return Err(Error::Other(anyhow::anyhow!(
                            "Watcher fell behind by {missed} changes"
                        )));
                    }
                    None => return Err(Error::WatchClosed),
                },
            }
        }
    }
}
