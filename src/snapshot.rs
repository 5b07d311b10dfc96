//! An immutable view of every registered copy of a service.

use crate::endpoint::{CopyId, Endpoint, Processor, Registration};

use serde::Serialize;
use std::collections::BTreeMap;

/// One deployed copy, and everything it registered.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct CopyRecord {
    pub id: CopyId,
    pub registration: Registration,
}

impl CopyRecord {
    pub fn new(id: CopyId, registration: Registration) -> Self {
        Self { id, registration }
    }
}

/// Every endpoint of a service, at a single point in time.
///
/// Snapshots are built once and never modified: updates replace the whole
/// snapshot. Within [Self::processors], the endpoints of each processor are
/// ordered by the ascending id of the copy that registered them, which is
/// what makes [Self::pick_by_hash] deterministic.
#[derive(Clone, PartialEq, Debug, Default, Serialize)]
pub struct Snapshot {
    copies: BTreeMap<CopyId, CopyRecord>,
    processors: BTreeMap<Processor, Vec<Endpoint>>,
}

impl Snapshot {
    /// Builds a snapshot out of a set of copies.
    ///
    /// If two records share an id, the later one replaces the earlier.
    pub fn new(records: impl IntoIterator<Item = CopyRecord>) -> Self {
        let copies: BTreeMap<_, _> = records
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        // The BTreeMap iterates in ascending copy id, so each processor's
        // endpoints come out in that same order.
        let mut processors: BTreeMap<Processor, Vec<Endpoint>> = BTreeMap::new();
        for record in copies.values() {
            for (processor, endpoint) in &record.registration.processors {
                processors
                    .entry(processor.clone())
                    .or_default()
                    .push(endpoint.clone());
            }
        }

        Self { copies, processors }
    }

    pub fn copies(&self) -> &BTreeMap<CopyId, CopyRecord> {
        &self.copies
    }

    pub fn processors(&self) -> &BTreeMap<Processor, Vec<Endpoint>> {
        &self.processors
    }

    pub fn copy(&self, id: CopyId) -> Option<&CopyRecord> {
        self.copies.get(&id)
    }

    /// Returns the endpoints of a processor, ordered by copy id.
    pub fn endpoints(&self, processor: &str) -> &[Endpoint] {
        self.processors
            .get(processor)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Spreads keys across the endpoints of a processor.
    ///
    /// The endpoint chosen is `crc32(key) % len`. This is not consistent
    /// hashing: adding or removing a copy may move most keys to a different
    /// endpoint.
    pub fn pick_by_hash(&self, processor: &str, key: &str) -> Option<&Endpoint> {
        let endpoints = self.endpoints(processor);
        if endpoints.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key.as_bytes());
        endpoints.get(hash as usize % endpoints.len())
    }

    /// Returns the endpoint of a processor within one specific copy.
    pub fn pick_by_copy(&self, id: CopyId, processor: &str) -> Option<&Endpoint> {
        self.copies.get(&id)?.registration.get(processor)
    }
}
