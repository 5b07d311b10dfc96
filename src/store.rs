//! The interface for the directory store, which services register into.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Store unavailable")]
    Unavailable,

    #[error("Watch was closed by the store")]
    WatchClosed,

    #[error("Failed to decode store response")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// A single entry within the directory tree.
///
/// Directories have children in [Node::nodes]; leaves have a [Node::value].
/// Keys are absolute, e.g. `/roc/dist2/account/0/reg`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub dir: bool,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub modified_index: u64,
}

impl Node {
    pub fn leaf(key: impl ToString, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    pub fn dir(key: impl ToString, nodes: Vec<Node>) -> Self {
        Self {
            key: key.to_string(),
            dir: true,
            nodes,
            ..Default::default()
        }
    }

    /// The final segment of this node's key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// Finds an immediate child by name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name() == name)
    }
}

/// What a read or a watch notification returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// What happened, e.g. `"get"`, `"set"` or `"delete"`.
    pub action: String,

    /// The store-wide index at which this response was produced.
    pub index: u64,

    /// The node that was read, or that changed.
    pub node: Node,
}

/// A stream of change notifications for one path.
#[async_trait]
pub trait Watcher: Send {
    /// Waits for the next change at or below the watched path.
    ///
    /// Any error ends the watch; callers are expected to create a new
    /// watcher.
    async fn next(&mut self) -> Result<Response, Error>;
}

/// Helper type for anything that implements the Watcher interface.
pub type BoxedWatcher = Box<dyn Watcher>;

/// Reads and watches a hierarchical key-value store.
///
/// Both operations may fail transiently; the resolver treats all failures
/// the same way, by reconnecting after a backoff.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the node at `path`.
    ///
    /// If `recursive` is false, directories include their immediate children
    /// but not grandchildren.
    async fn get(&self, path: &str, recursive: bool) -> Result<Response, Error>;

    /// Starts watching for changes at `path`.
    ///
    /// Only changes with an index greater than `after_index` are reported.
    /// Passing the index of an earlier read reports everything which
    /// happened since that read, including changes made before this call.
    fn watch(&self, path: &str, recursive: bool, after_index: u64) -> BoxedWatcher;
}

pub type SharedStore = Arc<dyn Store>;
