//! Client for the remote todo API and a cached session on top of it.
//!
//! [`TodoApi`] speaks HTTP. [`TodoSession`] binds a token to a [`QueryClient`](crate::QueryClient):
//! the todo list is a query on `["todos", token]` and every write is a mutation that
//! invalidates `["todos"]`.

mod api;
mod session;
mod types;

pub use api::{ApiConfig, ApiError, DEFAULT_API_URL, TodoApi};
pub use session::{TODOS_RETRIES, TODOS_STALE_TIME, TodoBackend, TodoSession};
pub use types::{Credentials, Deleted, NewTodo, RegisteredUser, Todo, Token};
