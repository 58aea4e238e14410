//! Retry policy for failed fetches.
//!
//! A failed fetch is re-invoked up to `max_retries` times with exponential backoff before
//! the entry settles into `error`. With `max_retries = 2` a fetch that always fails runs
//! exactly three times.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 2
/// - `initial_delay_ms`: 1000
/// - `max_delay_ms`: 30 000
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap for the exponential delay.
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Default backoff with a different retry budget.
    #[must_use]
    pub fn retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Calculate the delay before retry number `attempt` (zero based).
    ///
    /// delay = initial_delay * multiplier ^ attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// `on_failure` observes every failed attempt (1-based count) before the next retry or the
/// final error, so callers can publish failure progress. Between attempts the task sleeps for
/// the backoff delay; a zero delay still yields to the scheduler.
pub async fn retry_with_backoff<F, Fut, T, E, H>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_failure: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    H: FnMut(usize, &E),
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "fetch succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                on_failure(attempt + 1, &err);

                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "fetch failed after max retries"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch failed, retrying"
                );

                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
