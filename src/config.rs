use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Client-wide defaults.
///
/// Every field has a default, so a partial JSON or YAML document deserializes into a full
/// configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Time in milliseconds a successful result stays fresh.
    ///
    /// `0` means data is stale as soon as it arrives, so every new subscription refetches
    /// in the background.
    pub stale_ms: u64,

    /// Time in milliseconds an entry without subscribers is retained before it is dropped.
    pub gc_ms: u64,

    /// Upper bound on the number of cached entries.
    pub max_entries: u64,

    /// Retry policy applied to fetches.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            stale_ms: 0,
            gc_ms: 5 * 60 * 1_000,
            max_entries: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueryConfig {
    /// Defaults for individual queries created by a client with this configuration.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: Duration::from_millis(self.stale_ms),
            retry: self.retry.clone(),
            enabled: true,
        }
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_ms)
    }
}

/// Per-query options, see [`QueryClient::subscribe_with`](crate::QueryClient::subscribe_with).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// How long a successful result stays fresh.
    pub stale_time: Duration,
    pub retry: RetryPolicy,
    /// Disabled queries never fetch on subscription; cached data is still served.
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryConfig::default().default_options()
    }
}

impl QueryOptions {
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
