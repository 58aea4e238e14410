//! query-cache - A client-side query cache with stale-while-revalidate semantics
//!
//! This library provides:
//! - A keyed cache of remote query results with per-query staleness
//! - One in-flight request per key, shared by every concurrent caller
//! - Retry with exponential backoff for failed fetches
//! - Discarding of superseded and orphaned results
//! - Mutations that invalidate cached queries on success
//! - A typed client and cached session for a remote todo API
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{Mutation, QueryClient, QueryConfig, QueryError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueryError> {
//!     let client = QueryClient::with_config(QueryConfig {
//!         stale_ms: 20_000,
//!         ..QueryConfig::default()
//!     });
//!
//!     // Returns immediately; the fetch runs in the background.
//!     let mut todos = client.subscribe(["todos", "tok1"], |_key| async {
//!         Ok(vec!["Buy milk".to_string()])
//!     })?;
//!     let entry = todos.settled().await;
//!     assert_eq!(entry.data.map(|todos| todos.len()), Some(1));
//!
//!     // Marks ["todos", ..] stale after the write succeeds.
//!     let add = Mutation::new(client.clone(), |title: String| async move { Ok(title) })
//!         .invalidates(["todos"]);
//!     add.mutate("Walk dog".to_string()).await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod entry;
mod error;
mod key;
mod mutation;
mod retry;
mod slot;
mod subscription;
pub mod todos;

// Re-export public API
pub use client::QueryClient;
pub use config::{QueryConfig, QueryOptions};
pub use entry::{CacheEntry, QueryStatus};
pub use error::QueryError;
pub use key::{KeyPart, QueryKey};
pub use mutation::{Mutation, MutationState};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use subscription::QuerySubscription;
