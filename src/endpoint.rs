//! The types registered by services: copies, processors and their endpoints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifies one deployed copy of a service.
///
/// Copy ids are unique among the copies of a single service, and are stored
/// as the decimal name of the copy's entry within the service directory.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CopyId(pub u32);

impl CopyId {
    /// Parses a copy id from the final segment of a directory key.
    ///
    /// Returns `None` for anything which is not a non-negative decimal
    /// integer.
    pub fn parse(name: &str) -> Option<Self> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        name.parse().ok().map(Self)
    }
}

impl From<u32> for CopyId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CopyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Describes the name of a processor within a copy.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Processor(pub Arc<str>);

impl Processor {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for Processor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Processor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl From<String> for Processor {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Processor {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Processor {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a single processor can be reached.
///
/// servmap does not interpret endpoints; they are handed to callers exactly
/// as they were registered. The well-known `type` and `addr` fields are
/// exposed directly, and any other fields are kept in `extra`.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// The protocol spoken by the processor, e.g. `"thrift"` or `"http"`.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub kind: String,

    /// The address of the processor, usually `host:port`.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub addr: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// Registrations written by older deploy tooling leave unset fields as null.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Endpoint {
    pub fn new(kind: impl ToString, addr: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            addr: addr.to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Everything a single copy registered: one endpoint per processor.
///
/// On the wire (within the nested layout) this is an object with the
/// processor map under `"servs"`. The flat layout stores the bare processor
/// map instead; see [Registration::from_processor_map].
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "servs", alias = "Servs", default)]
    pub processors: BTreeMap<Processor, Endpoint>,
}

impl Registration {
    pub fn new(processors: BTreeMap<Processor, Endpoint>) -> Self {
        Self { processors }
    }

    /// Decodes a registration from the nested wire format.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Decodes a registration from a bare processor-to-endpoint map.
    pub fn from_processor_map(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s).map(Self::new)
    }

    pub fn get(&self, processor: &str) -> Option<&Endpoint> {
        self.processors.get(processor)
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
