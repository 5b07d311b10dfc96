//! servmap resolves logical service names into concrete endpoints.
//!
//! Services register themselves into a watchable directory store (such as
//! etcd). servmap keeps a process-local view of those registrations up to
//! date, and answers lookups against it without touching the network.
//!
//! It uses the following terminology:
//! * A service [location](service::Location) names the directory that a
//!   service registers itself under.
//! * A copy is one deployed instance-group of a service, identified by a small
//!   non-negative integer ([endpoint::CopyId]).
//! * A processor is a named role within a copy ([endpoint::Processor]), which
//!   is reachable at an [endpoint::Endpoint].
//! * A [snapshot::Snapshot] is an immutable view of every copy at one point in
//!   time.
//!
//! # Usage
//!
//! * The main interface for this crate is [resolver::Resolver].
//! * To construct a resolver, you must supply a [store::Store], which
//!   describes how to read and watch the directory tree. A default
//!   implementation for etcd exists in [stores::etcd] (behind the `"etcd"`
//!   feature), and an in-process one in [stores::memory].
//!
//! # Directory layout
//!
//! Two on-store layouts coexist, and a resolver picks one of them once, when
//! it is created (see [schema::SchemaVersion]):
//!
//! ```text
//! {prefix}/dist2/{location}/{copy id}/reg = {"servs": {processor: endpoint}}
//! {prefix}/dist/{location}/{copy id}      = {processor: endpoint}
//! ```
//!
//! # DTrace probes
//!
//! servmap contains a number of DTrace USDT probes, which fire as the resolver
//! follows the store. The full list of probes is:
//!
//! - `watch-start`: Fires when a new fetch-then-watch attempt begins.
//! - `watch-failed`: Fires when an attempt ends, with the reason.
//! - `refresh-done`: Fires after a snapshot has been published, with the
//!   number of copies it contains.
//! - `refresh-failed`: Fires when a re-fetch or parse fails, leaving the
//!   previous snapshot in place.
//! - `backoff`: Fires before sleeping between attempts, with the delay.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Registration failures are logged, and do not prevent
//! a resolver from being created.

// Public API
pub mod config;
pub mod endpoint;
pub mod parser;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod store;

// Necessary for implementation
mod backoff;
mod cache;
#[cfg(test)]
mod test_utils;
mod watcher;

// Default implementations of generic interfaces
pub mod stores;

pub use resolver::Resolver;

/// USDT probes for tracing how servmap follows the store.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "servmap")]
mod probes {
    /// Fires when a fetch-then-watch attempt starts against a path.
    fn watch__start(path: &str) {}

    /// Fires when a fetch-then-watch attempt ends, with a string identifying
    /// the reason.
    fn watch__failed(path: &str, reason: &str) {}

    /// Fires after a new snapshot has been published.
    fn refresh__done(path: &str, copies: u64) {}

    /// Fires when a refresh could not produce a snapshot. The previously
    /// published snapshot stays in place.
    fn refresh__failed(path: &str, reason: &str) {}

    /// Fires before the coordinator sleeps between attempts.
    fn backoff(path: &str, delay_ms: u64) {}
}
