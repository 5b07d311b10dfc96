//! Interface for services
use std::sync::Arc;

/// Describes the location of a service within the directory store.
///
/// This is the logical name a service registers itself under, such as
/// `"base/account"`. It is joined onto a prefix and a schema segment to form
/// the directory which is actually watched.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Location(pub Arc<str>);

impl Location {
    pub fn new(s: impl ToString) -> Self {
        Self(Arc::from(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Locations are relative: they may not be empty, start or end with a
    // separator, or contain empty segments.
    pub(crate) fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.split('/').all(|segment| !segment.is_empty())
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Location {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&'_ str> for Location {
    fn from(s: &'_ str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for Location {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Location {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}
