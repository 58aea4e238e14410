use crate::key::QueryKey;

/// Error type for query and mutation operations.
///
/// Errors are stored inside cache entries and handed to every caller attached to the
/// same in-flight request, so the type is cheap to clone and carries messages rather
/// than source errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The fetch function rejected.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A mutation function rejected.
    #[error("mutation failed: {0}")]
    Mutation(String),

    /// The remote side refused the credentials (401).
    ///
    /// Callers should drop their token and re-authenticate.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The key is already cached with a different value type.
    #[error("query {key} is cached with a different value type")]
    TypeMismatch { key: QueryKey },

    /// A one-shot fetch was requested for a disabled query with nothing cached.
    #[error("query {key} is disabled")]
    Disabled { key: QueryKey },

    /// Queries were used outside a Tokio runtime, so no request could be spawned.
    #[error("no Tokio runtime to run queries on")]
    NoRuntime,
}

impl QueryError {
    /// Create a fetch error.
    pub fn fetch(message: impl Into<String>) -> Self {
        QueryError::Fetch(message.into())
    }

    /// Create a mutation error.
    pub fn mutation(message: impl Into<String>) -> Self {
        QueryError::Mutation(message.into())
    }

    /// Returns `true` for the authentication subtype.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, QueryError::Unauthorized(_))
    }
}
