use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;

/// Lifecycle of a cached query.
///
/// ```text
/// idle ──subscribe──▶ fetching ──ok──▶ success
///                        │  ▲            │
///                 err,   │  │ retry      │ refetch / stale re-subscribe
///                 budget │  └────────────┤
///                 spent  ▼               ▼
///                      error ─────────▶ fetching
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Created but never fetched.
    Idle,
    /// A request is in flight.
    Fetching,
    /// The last request succeeded.
    Success,
    /// The last request failed after all retries.
    Error,
}

/// Snapshot of one cached query.
///
/// Snapshots are copies: the cache itself only changes through the client's transitions.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Result of the last successful fetch.
    ///
    /// Kept across later failures and while a refetch is running.
    pub data: Option<V>,
    pub status: QueryStatus,
    /// Error of the last settled request, cleared by the next success.
    pub error: Option<QueryError>,
    /// When `data` was fetched.
    pub fetched_at: Option<Instant>,
    /// How long `data` stays fresh after `fetched_at`, as configured by the subscription that
    /// created the entry. Each subscription judges freshness by its own options.
    pub stale_time: Duration,
    /// Marked stale explicitly, independent of age.
    pub is_invalidated: bool,
    /// Failed attempts of the current or last request.
    pub failure_count: usize,
    /// Error of the last failed attempt, visible while retries are still running.
    pub failure_reason: Option<QueryError>,
}

impl<V> CacheEntry<V> {
    /// Create an idle entry.
    pub fn new(stale_time: Duration) -> Self {
        CacheEntry {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            stale_time,
            is_invalidated: false,
            failure_count: 0,
            failure_reason: None,
        }
    }

    /// Check if the entry holds data that is still fresh at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.is_fresh_for(now, self.stale_time)
    }

    /// Check freshness at `now` against a caller's own `stale_time`.
    pub fn is_fresh_for(&self, now: Instant, stale_time: Duration) -> bool {
        if self.is_invalidated || self.data.is_none() {
            return false;
        }
        self.fetched_at
            .is_some_and(|at| now.saturating_duration_since(at) < stale_time)
    }

    /// Check if the entry holds data that is stale at `now`.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.data.is_some() && !self.is_fresh(now)
    }

    /// Returns `true` if a subscription at `now` must start a fetch.
    pub fn needs_fetch(&self, now: Instant) -> bool {
        !self.is_fresh(now)
    }

    /// Fetching with nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Fetching && self.data.is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Fetching
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub(crate) fn begin_fetch(&mut self) {
        self.status = QueryStatus::Fetching;
        self.failure_count = 0;
        self.failure_reason = None;
    }

    pub(crate) fn record_failure(&mut self, attempts: usize, error: &QueryError) {
        self.failure_count = attempts;
        self.failure_reason = Some(error.clone());
    }

    pub(crate) fn succeed(&mut self, data: V, fetched_at: Instant, still_invalidated: bool) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.error = None;
        self.fetched_at = Some(fetched_at);
        self.is_invalidated = still_invalidated;
        self.failure_count = 0;
        self.failure_reason = None;
    }

    pub(crate) fn fail(&mut self, error: QueryError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
    }

    /// Return to `status` after the in-flight request was dropped.
    pub(crate) fn restore(&mut self, status: QueryStatus) {
        self.status = status;
    }
}
