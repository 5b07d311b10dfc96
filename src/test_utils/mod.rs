//! Utilities to help with testing servmap

use crate::endpoint::{Endpoint, Processor, Registration};
use crate::stores::memory::MemoryStore;

use std::collections::BTreeMap;

pub(crate) fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    // Several tests in the same binary may try to install a subscriber;
    // only the first one wins.
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A "thrift" endpoint at the given address.
pub(crate) fn endpoint(addr: &str) -> Endpoint {
    Endpoint::new("thrift", addr)
}

/// A registration from `(processor, address)` pairs.
pub(crate) fn registration(processors: &[(&str, &str)]) -> Registration {
    Registration::new(
        processors
            .iter()
            .map(|(name, addr)| (Processor::new(name), endpoint(addr)))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// The value stored under `reg` in the nested layout.
pub(crate) fn nested_json(processors: &[(&str, &str)]) -> String {
    serde_json::to_string(&registration(processors)).unwrap()
}

/// The value stored for a copy in the flat layout.
pub(crate) fn flat_json(processors: &[(&str, &str)]) -> String {
    serde_json::to_string(&registration(processors).processors).unwrap()
}

/// Registers one copy into a memory store, using the nested layout.
pub(crate) fn register_v2(store: &MemoryStore, dir: &str, id: u32, processors: &[(&str, &str)]) {
    store
        .set(&format!("{dir}/{id}/reg"), nested_json(processors))
        .unwrap();
}

/// Registers one copy into a memory store, using the flat layout.
pub(crate) fn register_v1(store: &MemoryStore, dir: &str, id: u32, processors: &[(&str, &str)]) {
    store
        .set(&format!("{dir}/{id}"), flat_json(processors))
        .unwrap();
}
