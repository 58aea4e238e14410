use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use tokio::runtime::Handle;

use crate::config::{QueryConfig, QueryOptions};
use crate::entry::CacheEntry;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::slot::{ErasedSlot, Fetcher, Slot};
use crate::subscription::QuerySubscription;

type ActiveMap = HashMap<QueryKey, Arc<dyn ErasedSlot>>;

struct ClientInner {
    /// Entries with at least one subscriber. These are never evicted.
    active: Mutex<ActiveMap>,
    /// Entries without subscribers, kept for the gc time and bounded by `max_entries`.
    idle: Cache<QueryKey, Arc<dyn ErasedSlot>>,
    config: QueryConfig,
}

/// Owned query cache.
///
/// `QueryClient` maps [`QueryKey`]s to cached entries and is the only writer of those
/// entries. It is a cheap handle: clones share the same cache, and the cache is torn down
/// when the last handle and subscription are dropped (or explicitly with [`clear`]).
///
/// Fetches run on the Tokio runtime the entry was created on. Subscribing outside a runtime
/// fails with [`QueryError::NoRuntime`].
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::with_config(QueryConfig {
///     stale_ms: 20_000,
///     ..QueryConfig::default()
/// });
///
/// let todos = client.subscribe(["todos", token.as_str()], move |_key| {
///     let api = api.clone();
///     let token = token.clone();
///     async move { api.list_todos(&token).await.map_err(ApiError::into_fetch_error) }
/// })?;
///
/// // Cached data (possibly stale) is available right away.
/// let shown = todos.data();
/// ```
///
/// [`clear`]: QueryClient::clear
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Create a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Create a client with the given configuration.
    pub fn with_config(config: QueryConfig) -> Self {
        let idle = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.gc_time())
            .eviction_listener(
                |key: Arc<QueryKey>, slot: Arc<dyn ErasedSlot>, cause: RemovalCause| {
                    // Explicit removals are entries moving back to the active map.
                    if cause.was_evicted() && slot.retire_unobserved() {
                        tracing::debug!(key = %key, ?cause, "query dropped from cache");
                    }
                },
            )
            .build();

        QueryClient {
            inner: Arc::new(ClientInner {
                active: Mutex::new(HashMap::new()),
                idle,
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Options used by [`subscribe`](Self::subscribe) and [`fetch`](Self::fetch).
    pub fn default_options(&self) -> QueryOptions {
        self.inner.config.default_options()
    }

    /// Subscribe to `key` with the client's default options.
    pub fn subscribe<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<QuerySubscription<V>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        self.subscribe_with(key, fetcher, self.default_options())
    }

    /// Subscribe to `key`.
    ///
    /// The entry is created on first use. If it holds no data, or its data is stale under
    /// `options.stale_time` or invalidated, a fetch starts in the background (or the
    /// subscription attaches to the fetch already in flight). The subscription returns
    /// immediately with whatever is cached.
    ///
    /// Fails with [`QueryError::TypeMismatch`] when `key` is cached with another type, and
    /// with [`QueryError::NoRuntime`] outside a Tokio runtime.
    pub fn subscribe_with<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<QuerySubscription<V>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let key = key.into();
        let fetcher: Fetcher<V> = Arc::new(move |key| fetcher(key).boxed());

        let slot = self.acquire::<V>(&key, options.stale_time)?;
        let subscription = QuerySubscription::new(self.clone(), key, slot, fetcher, options);
        subscription.fetch_if_needed();
        Ok(subscription)
    }

    /// Resolve `key` once with the client's default options.
    pub async fn fetch<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        self.fetch_with(key, fetcher, self.default_options()).await
    }

    /// Resolve `key` once.
    ///
    /// Fresh data is returned without fetching. Otherwise the call waits for the in-flight
    /// request (starting one if needed) and returns its result.
    pub async fn fetch_with<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let subscription = self.subscribe_with(key, fetcher, options)?;
        subscription.resolve().await
    }

    /// Snapshot of the entry for `key`, if it is cached with value type `V`.
    pub fn entry<V>(&self, key: impl Into<QueryKey>) -> Option<CacheEntry<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let key: QueryKey = key.into();
        let active = self.lock_active().get(&key).cloned();
        let slot = active.or_else(|| self.inner.idle.get(&key))?;
        let slot = slot.into_any().downcast::<Slot<V>>().ok()?;
        Some(slot.snapshot())
    }

    /// Mark every entry whose key starts with `prefix` as stale.
    ///
    /// The next subscription to an invalidated key refetches even inside the staleness
    /// window. Returns the number of matching entries.
    pub fn invalidate(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let active = self.lock_active();
        let mut matched = 0;

        for (key, slot) in active.iter() {
            if key.starts_with(&prefix) {
                slot.invalidate();
                matched += 1;
            }
        }
        for (key, slot) in self.inner.idle.iter() {
            if key.starts_with(&prefix) {
                slot.invalidate();
                matched += 1;
            }
        }

        tracing::debug!(prefix = %prefix, matched, "invalidated queries");
        matched
    }

    /// Drop every entry whose key starts with `prefix`.
    ///
    /// Results of requests still in flight for those entries are discarded. Returns the number
    /// of removed entries.
    pub fn remove(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let mut active = self.lock_active();
        let before = active.len();

        active.retain(|key, slot| {
            let keep = !key.starts_with(&prefix);
            if !keep {
                slot.retire();
            }
            keep
        });
        let mut removed = before - active.len();

        let idle: Vec<_> = self
            .inner
            .idle
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();
        for (key, slot) in &idle {
            slot.retire();
            self.inner.idle.invalidate(key.as_ref());
        }
        removed += idle.len();

        tracing::debug!(prefix = %prefix, removed, "removed queries");
        removed
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut active = self.lock_active();

        for (_, slot) in active.drain() {
            slot.retire();
        }
        for (_, slot) in self.inner.idle.iter() {
            slot.retire();
        }
        self.inner.idle.invalidate_all();
        self.inner.idle.run_pending_tasks();

        tracing::debug!("query cache cleared");
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let active = self.lock_active();
        active.len() + self.inner.idle.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create the slot for `key` and register a subscriber on it.
    ///
    /// An idle entry that gains a subscriber moves back to the active map.
    fn acquire<V>(&self, key: &QueryKey, stale_time: Duration) -> Result<Arc<Slot<V>>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;
        let mut active = self.lock_active();

        if let Some(erased) = active.get(key) {
            let slot = downcast::<V>(key, erased.clone())?;
            slot.acquire();
            return Ok(slot);
        }

        if let Some(erased) = self.inner.idle.get(key) {
            let slot = downcast::<V>(key, erased)?;
            if slot.acquire() {
                tracing::trace!(key = %key, "reviving idle query entry");
                self.inner.idle.invalidate(key);
                active.insert(key.clone(), slot.clone());
                return Ok(slot);
            }
        }

        tracing::debug!(key = %key, "creating query entry");
        let slot = Slot::<V>::new(key.clone(), stale_time, runtime);
        slot.acquire();
        active.insert(key.clone(), slot.clone());
        Ok(slot)
    }

    /// Unregister a subscriber; the last one moves the entry to the idle cache.
    pub(crate) fn release<V>(&self, key: &QueryKey, slot: &Arc<Slot<V>>)
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut active = self.lock_active();

        if slot.release() > 0 || slot.is_retired() {
            return;
        }

        if active.get(key).is_some_and(|current| same_slot(current, slot)) {
            tracing::trace!(key = %key, "last subscriber left");
            active.remove(key);
            self.inner.idle.insert(key.clone(), slot.clone());
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveMap> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<V>(key: &QueryKey, slot: Arc<dyn ErasedSlot>) -> Result<Arc<Slot<V>>, QueryError>
where
    V: Clone + Send + Sync + 'static,
{
    slot.into_any()
        .downcast::<Slot<V>>()
        .map_err(|_| QueryError::TypeMismatch { key: key.clone() })
}

fn same_slot<V>(erased: &Arc<dyn ErasedSlot>, slot: &Arc<Slot<V>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(erased), Arc::as_ptr(slot))
}
