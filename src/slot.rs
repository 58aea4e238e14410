//! Per-key query state and request bookkeeping.
//!
//! Every cached key owns one slot. A slot tracks the entry snapshot (published through a
//! watch channel), the number of subscribers and the single request that may currently write
//! to the entry. Requests are numbered; only the newest request is allowed to settle the
//! entry, so a response to a superseded request is dropped on arrival.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::entry::{CacheEntry, QueryStatus};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Caller-supplied fetch function.
pub(crate) type Fetcher<V> =
    Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

/// A request that several callers can await.
pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

/// Operations the client performs without knowing the value type.
pub(crate) trait ErasedSlot: Send + Sync {
    /// Mark the entry stale. Returns `true` if it was fresh before.
    fn invalidate(&self) -> bool;

    /// Detach the slot from the cache; pending results for it are discarded.
    fn retire(&self);

    /// Retire the slot unless it has subscribers. Returns `true` if it was retired.
    fn retire_unobserved(&self) -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct InFlight<V> {
    id: u64,
    /// Invalidation epoch when the request started.
    epoch: u64,
    future: SharedFetch<V>,
}

struct Control<V> {
    in_flight: Option<InFlight<V>>,
    last_request: u64,
    invalidation_epoch: u64,
    /// Status to return to if the in-flight result is discarded.
    settled_status: QueryStatus,
}

pub(crate) struct Slot<V> {
    key: QueryKey,
    observers: AtomicUsize,
    retired: AtomicBool,
    state: watch::Sender<CacheEntry<V>>,
    control: Mutex<Control<V>>,
    /// Runtime that requests are spawned on.
    runtime: Handle,
}

impl<V> Slot<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: QueryKey, stale_time: Duration, runtime: Handle) -> Arc<Self> {
        let (state, _) = watch::channel(CacheEntry::new(stale_time));
        Arc::new(Slot {
            key,
            observers: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            state,
            control: Mutex::new(Control {
                in_flight: None,
                last_request: 0,
                invalidation_epoch: 0,
                settled_status: QueryStatus::Idle,
            }),
            runtime,
        })
    }

    pub(crate) fn snapshot(&self) -> CacheEntry<V> {
        self.state.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<CacheEntry<V>> {
        self.state.subscribe()
    }

    /// Register a subscriber. Fails if the slot was already retired.
    pub(crate) fn acquire(&self) -> bool {
        let _control = self.lock();
        if self.is_retired() {
            return false;
        }
        self.observers.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Unregister a subscriber, returning the remaining count.
    pub(crate) fn release(&self) -> usize {
        self.observers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// The request currently allowed to settle the entry, if any.
    pub(crate) fn in_flight(&self) -> Option<SharedFetch<V>> {
        self.lock()
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.future.clone())
    }

    /// Start a request, or attach to the one in flight.
    ///
    /// With `supersede` a new request is always started and the in-flight one loses the right
    /// to write its result. The request runs on a spawned task, so it completes even if no
    /// caller awaits the returned future.
    pub(crate) fn ensure_fetch(
        self: &Arc<Self>,
        fetcher: Fetcher<V>,
        retry: RetryPolicy,
        supersede: bool,
    ) -> SharedFetch<V> {
        let mut control = self.lock();

        if !supersede && let Some(in_flight) = &control.in_flight {
            tracing::trace!(key = %self.key, request_id = in_flight.id, "attaching to in-flight fetch");
            return in_flight.future.clone();
        }

        match control.in_flight.as_ref().map(|in_flight| in_flight.id) {
            Some(superseded) => {
                tracing::debug!(key = %self.key, superseded, "superseding in-flight fetch");
            }
            None => control.settled_status = self.state.borrow().status,
        }

        control.last_request += 1;
        let id = control.last_request;
        let future = run_request(Arc::downgrade(self), self.key.clone(), id, fetcher, retry)
            .boxed()
            .shared();

        control.in_flight = Some(InFlight {
            id,
            epoch: control.invalidation_epoch,
            future: future.clone(),
        });
        self.state.send_modify(CacheEntry::begin_fetch);
        drop(control);

        tracing::debug!(key = %self.key, request_id = id, "fetch started");
        self.runtime.spawn(future.clone());
        future
    }

    fn record_failure(&self, id: u64, attempts: usize, error: &QueryError) {
        let control = self.lock();
        if control.in_flight.as_ref().is_some_and(|f| f.id == id) {
            self.state
                .send_modify(|entry| entry.record_failure(attempts, error));
        }
    }

    /// Apply the outcome of request `id` if it is still the newest one and the key is still
    /// observed.
    fn settle(&self, id: u64, result: &Result<V, QueryError>) {
        let mut control = self.lock();

        let Some(epoch) = control
            .in_flight
            .as_ref()
            .filter(|in_flight| in_flight.id == id)
            .map(|in_flight| in_flight.epoch)
        else {
            tracing::debug!(key = %self.key, request_id = id, "discarding superseded result");
            return;
        };
        control.in_flight = None;

        if self.is_retired() || self.observers.load(Ordering::SeqCst) == 0 {
            tracing::debug!(key = %self.key, request_id = id, "discarding orphaned result");
            let status = control.settled_status;
            self.state.send_modify(|entry| entry.restore(status));
            return;
        }

        match result {
            Ok(data) => {
                let still_invalidated = epoch != control.invalidation_epoch;
                self.state.send_modify(|entry| {
                    entry.succeed(data.clone(), Instant::now(), still_invalidated);
                });
                tracing::debug!(key = %self.key, request_id = id, "fetch succeeded");
            }
            Err(error) => {
                self.state.send_modify(|entry| entry.fail(error.clone()));
                tracing::warn!(key = %self.key, request_id = id, error = %error, "fetch failed");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control<V>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> ErasedSlot for Slot<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn invalidate(&self) -> bool {
        let mut control = self.lock();
        control.invalidation_epoch += 1;
        self.state.send_if_modified(|entry| {
            let was_valid = !entry.is_invalidated;
            entry.is_invalidated = true;
            was_valid
        })
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn retire_unobserved(&self) -> bool {
        let _control = self.lock();
        if self.observers.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.retire();
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Run one request with retries, then try to settle it.
///
/// Settling happens inside the shared future, so the entry is updated before any awaiting
/// caller observes the result.
async fn run_request<V>(
    slot: Weak<Slot<V>>,
    key: QueryKey,
    id: u64,
    fetcher: Fetcher<V>,
    retry: RetryPolicy,
) -> Result<V, QueryError>
where
    V: Clone + Send + Sync + 'static,
{
    let result = retry_with_backoff(
        &retry,
        || fetcher(key.clone()),
        |attempts, error| {
            if let Some(slot) = slot.upgrade() {
                slot.record_failure(id, attempts, error);
            }
        },
    )
    .await;

    match slot.upgrade() {
        Some(slot) => slot.settle(id, &result),
        None => tracing::debug!(key = %key, request_id = id, "discarding result for dropped query"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_fetcher(calls: Arc<AtomicUsize>) -> Fetcher<usize> {
        Arc::new(move |_key| {
            let calls = calls.clone();
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) }.boxed()
        })
    }

    #[tokio::test]
    async fn test_attaches_to_in_flight_request() {
        let slot = Slot::new(QueryKey::from(["n"]), Duration::from_secs(60), Handle::current());
        slot.acquire();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = slot.ensure_fetch(counting_fetcher(calls.clone()), RetryPolicy::none(), false);
        let second = slot.ensure_fetch(counting_fetcher(calls.clone()), RetryPolicy::none(), false);

        assert_eq!(first.await, Ok(1));
        assert_eq!(second.await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slot.snapshot().data, Some(1));
        assert!(slot.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_result_without_observers_is_discarded() {
        let slot = Slot::new(QueryKey::from(["n"]), Duration::from_secs(60), Handle::current());
        let calls = Arc::new(AtomicUsize::new(0));

        let result = slot
            .ensure_fetch(counting_fetcher(calls), RetryPolicy::none(), false)
            .await;

        assert_eq!(result, Ok(1));
        let entry = slot.snapshot();
        assert_eq!(entry.data, None);
        assert_eq!(entry.status, QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_survives_result() {
        let slot = Slot::new(QueryKey::from(["n"]), Duration::from_secs(60), Handle::current());
        slot.acquire();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let fetcher: Fetcher<usize> = Arc::new(move |_key| {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(7)
            }
            .boxed()
        });

        let pending = slot.ensure_fetch(fetcher, RetryPolicy::none(), false);
        assert!(slot.invalidate());
        release_tx.send(()).unwrap();
        pending.await.unwrap();

        let entry = slot.snapshot();
        assert_eq!(entry.data, Some(7));
        assert!(entry.is_invalidated);
        assert!(entry.needs_fetch(Instant::now()));
    }
}
