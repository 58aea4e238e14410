use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::QueryClient;
use crate::config::QueryOptions;
use crate::entry::{CacheEntry, QueryStatus};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::slot::{Fetcher, Slot};

/// A registered consumer of one query.
///
/// While at least one subscription to a key is alive the entry is kept and results for it
/// are written to the cache. Dropping the last subscription starts the retention clock; a
/// fetch that completes after that is discarded.
///
/// State changes are delivered through a watch channel: [`changed`](Self::changed) wakes on
/// every transition and [`settled`](Self::settled) waits for the in-flight request to finish.
pub struct QuerySubscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    client: QueryClient,
    key: QueryKey,
    slot: Arc<Slot<V>>,
    rx: watch::Receiver<CacheEntry<V>>,
    fetcher: Fetcher<V>,
    options: QueryOptions,
}

impl<V> QuerySubscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        client: QueryClient,
        key: QueryKey,
        slot: Arc<Slot<V>>,
        fetcher: Fetcher<V>,
        options: QueryOptions,
    ) -> Self {
        let rx = slot.watch();
        QuerySubscription {
            client,
            key,
            slot,
            rx,
            fetcher,
            options,
        }
    }

    /// Start a fetch if the cached data is absent, stale or invalidated.
    pub(crate) fn fetch_if_needed(&self) {
        if !self.options.enabled {
            tracing::trace!(key = %self.key, "query disabled, serving cache only");
            return;
        }

        if !self.is_fresh() {
            // The request runs on its own task; nothing here awaits it.
            let _ = self
                .slot
                .ensure_fetch(self.fetcher.clone(), self.options.retry.clone(), false);
        } else {
            tracing::trace!(key = %self.key, "serving fresh data");
        }
    }

    /// Whether the cached data is fresh under this subscription's stale time.
    pub fn is_fresh(&self) -> bool {
        self.slot
            .snapshot()
            .is_fresh_for(Instant::now(), self.options.stale_time)
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Snapshot of the entry as of now.
    pub fn entry(&self) -> CacheEntry<V> {
        self.rx.borrow().clone()
    }

    /// Cached data, possibly stale.
    pub fn data(&self) -> Option<V> {
        self.rx.borrow().data.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.rx.borrow().status
    }

    /// Wait for the next change of the entry and return the new snapshot.
    ///
    /// Changes that happened since the last call to `changed` or `settled` complete
    /// immediately.
    pub async fn changed(&mut self) -> CacheEntry<V> {
        // The sender lives in the slot we hold, so the channel never closes.
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }

    /// Wait until no request is in flight and return the settled snapshot.
    pub async fn settled(&mut self) -> CacheEntry<V> {
        match self.rx.wait_for(|entry| !entry.is_fetching()).await {
            Ok(entry) => entry.clone(),
            Err(_) => self.slot.snapshot(),
        }
    }

    /// Force a new request even if the data is fresh.
    ///
    /// A request already in flight is superseded: its result is still returned to whoever
    /// awaits it, but it is no longer written to the cache. The request runs in the background,
    /// so the returned future may be dropped.
    pub fn refetch(&self) -> impl Future<Output = Result<V, QueryError>> + Send + use<V> {
        self.slot
            .ensure_fetch(self.fetcher.clone(), self.options.retry.clone(), true)
    }

    /// Resolve the query once: fresh data, otherwise the result of the current request.
    pub(crate) async fn resolve(&self) -> Result<V, QueryError> {
        let entry = self.entry();
        if entry.is_fresh_for(Instant::now(), self.options.stale_time)
            && let Some(data) = entry.data
        {
            return Ok(data);
        }

        if let Some(in_flight) = self.slot.in_flight() {
            return in_flight.await;
        }

        let entry = self.entry();
        if !self.options.enabled {
            return entry.data.ok_or_else(|| QueryError::Disabled {
                key: self.key.clone(),
            });
        }

        // The request started on subscription may already have settled.
        match (entry.status, entry.data, entry.error) {
            (QueryStatus::Success, Some(data), _) => Ok(data),
            (QueryStatus::Error, _, Some(error)) => Err(error),
            _ => {
                self.slot
                    .ensure_fetch(self.fetcher.clone(), self.options.retry.clone(), false)
                    .await
            }
        }
    }
}

impl<V> Drop for QuerySubscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.client.release(&self.key, &self.slot);
    }
}
