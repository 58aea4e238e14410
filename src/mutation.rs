//! One-shot write operations.
//!
//! A [`Mutation`] wraps an asynchronous write (create, update, delete) and tracks its
//! lifecycle as a [`MutationState`]. Mutations are not cached. On success they mark the query
//! keys they declare through [`Mutation::invalidates`] as stale, so the next subscription to
//! those keys refetches.
//!
//! # Example
//!
//! ```ignore
//! let add = Mutation::new(client.clone(), move |todo: NewTodo| {
//!     let api = api.clone();
//!     let token = token.clone();
//!     async move { api.create_todo(&token, &todo).await.map_err(ApiError::into_mutation_error) }
//! })
//! .invalidates(["todos"]);
//!
//! add.mutate(NewTodo::new("Buy milk")).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;

type MutateFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync>;

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState<O> {
    /// Not started, or reset.
    Idle,
    /// The write is in progress.
    Pending,
    /// The write succeeded with a result.
    Success(O),
    /// The write failed.
    Error(QueryError),
}

impl<O> MutationState<O> {
    /// Returns the result if the mutation succeeded.
    pub const fn data(&self) -> Option<&O> {
        match self {
            MutationState::Success(data) => Some(data),
            _ => None,
        }
    }

    pub const fn error(&self) -> Option<&QueryError> {
        match self {
            MutationState::Error(error) => Some(error),
            _ => None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self, MutationState::Idle)
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self, MutationState::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, MutationState::Success(_))
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, MutationState::Error(_))
    }
}

/// A write operation bound to a [`QueryClient`].
///
/// Failures are returned to the caller and recorded in the state; they are never retried and
/// leave the cache untouched. When calls overlap, the most recent call owns the state while
/// every call still returns its own result.
pub struct Mutation<I, O> {
    client: QueryClient,
    mutate_fn: MutateFn<I, O>,
    invalidates: Vec<QueryKey>,
    state: watch::Sender<MutationState<O>>,
    /// Number of the call that owns `state`.
    latest_call: AtomicU64,
}

impl<I, O> Mutation<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(client: QueryClient, mutate_fn: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, QueryError>> + Send + 'static,
    {
        let (state, _) = watch::channel(MutationState::Idle);
        Mutation {
            client,
            mutate_fn: Arc::new(move |input| mutate_fn(input).boxed()),
            invalidates: Vec::new(),
            state,
            latest_call: AtomicU64::new(0),
        }
    }

    /// Mark queries whose key starts with `prefix` stale after every successful call.
    #[must_use]
    pub fn invalidates(mut self, prefix: impl Into<QueryKey>) -> Self {
        self.invalidates.push(prefix.into());
        self
    }

    /// Run the write.
    pub async fn mutate(&self, input: I) -> Result<O, QueryError> {
        let call = self.latest_call.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(MutationState::Pending);
        tracing::debug!(call, "mutation started");

        let result = (self.mutate_fn)(input).await;

        match &result {
            Ok(_) => {
                for prefix in &self.invalidates {
                    self.client.invalidate(prefix.clone());
                }
                tracing::debug!(call, "mutation succeeded");
            }
            Err(error) => tracing::warn!(call, error = %error, "mutation failed"),
        }

        if self.latest_call.load(Ordering::SeqCst) == call {
            self.state.send_replace(match &result {
                Ok(data) => MutationState::Success(data.clone()),
                Err(error) => MutationState::Error(error.clone()),
            });
        } else {
            tracing::debug!(call, "newer mutation owns the state");
        }

        result
    }

    pub fn state(&self) -> MutationState<O> {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<O>> {
        self.state.subscribe()
    }

    /// Return to `Idle`. Calls still running no longer update the state.
    pub fn reset(&self) {
        self.latest_call.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(MutationState::Idle);
    }
}
