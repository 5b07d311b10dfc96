//! Configuration options which can alter the behavior of a resolver.

use std::time::Duration;

/// Prefix under which all service directories live.
pub const DEFAULT_BASE_PREFIX: &str = "/roc";

// How long do we wait before reconnecting to the store, after the first
// failure?
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(10);

// How long can the wait between reconnection attempts grow?
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration options to tweak resolution behavior.
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory which holds every service's registrations.
    ///
    /// Must start with `/`, and must not end with one.
    ///
    /// Default: `"/roc"`
    pub base_prefix: String,

    /// How long to wait before reconnecting after a failure. Doubles after
    /// each consecutive failure.
    ///
    /// Default: 10 milliseconds
    pub min_backoff: Duration,

    /// The longest wait between reconnection attempts.
    ///
    /// Default: 5 seconds
    pub max_backoff: Duration,

    /// Random jitter added to each backoff wait.
    ///
    /// Default: Zero
    pub backoff_spread: Duration,
}

impl Config {
    pub(crate) fn prefix_is_valid(&self) -> bool {
        let prefix = &self.base_prefix;
        prefix.starts_with('/') && !prefix.ends_with('/')
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_prefix: DEFAULT_BASE_PREFIX.to_string(),
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_spread: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn prefix_validation() {
        let valid = |prefix: &str| {
            Config {
                base_prefix: prefix.to_string(),
                ..Default::default()
            }
            .prefix_is_valid()
        };
        assert!(valid("/roc"));
        assert!(valid("/a/b"));
        assert!(!valid("roc"));
        assert!(!valid("/roc/"));
        assert!(!valid("/"));
        assert!(!valid(""));
    }
}
