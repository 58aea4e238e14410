//! HTTP client for the remote todo API.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::QueryError;
use crate::todos::types::{Credentials, Deleted, NewTodo, RegisteredUser, Todo, Token};

/// Base URL used when `TODO_API_URL` is not set.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Errors returned by [`TodoApi`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// 401: the token is missing, expired or the credentials are wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other non-success status, with the server's `detail` message.
    #[error("request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Convert for use as a query fetch error.
    pub fn into_fetch_error(self) -> QueryError {
        match self {
            ApiError::Unauthorized(detail) => QueryError::Unauthorized(detail),
            other => QueryError::Fetch(other.to_string()),
        }
    }

    /// Convert for use as a mutation error.
    pub fn into_mutation_error(self) -> QueryError {
        match self {
            ApiError::Unauthorized(detail) => QueryError::Unauthorized(detail),
            other => QueryError::Mutation(other.to_string()),
        }
    }
}

/// Where the todo API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: Url,
}

impl ApiConfig {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;

        // Endpoints are joined relative to the base path.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(ApiConfig { base_url })
    }

    /// Read `TODO_API_URL`, falling back to [`DEFAULT_API_URL`].
    pub fn from_env() -> Result<Self, ApiError> {
        let base_url =
            std::env::var("TODO_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::new(&base_url)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Typed client for the login, register and todo endpoints.
#[derive(Debug, Clone)]
pub struct TodoApi {
    http: Client,
    config: ApiConfig,
}

impl TodoApi {
    pub fn new(config: ApiConfig) -> Self {
        TodoApi {
            http: Client::new(),
            config,
        }
    }

    pub fn from_env() -> Result<Self, ApiError> {
        Ok(Self::new(ApiConfig::from_env()?))
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Exchange credentials for a bearer token (`POST /token`, form-encoded).
    pub async fn login(&self, credentials: &Credentials) -> Result<Token, ApiError> {
        let request = self.http.post(self.url("token")?).form(credentials);
        send(request).await
    }

    /// Create an account (`POST /users/`).
    ///
    /// A rejected registration surfaces the server's `detail`, e.g. "Username already
    /// registered".
    pub async fn register(&self, credentials: &Credentials) -> Result<RegisteredUser, ApiError> {
        let request = self.http.post(self.url("users/")?).json(credentials);
        send(request).await
    }

    pub async fn list_todos(&self, token: &str) -> Result<Vec<Todo>, ApiError> {
        let request = self.http.get(self.url("todos/")?).bearer_auth(token);
        send(request).await
    }

    pub async fn create_todo(&self, token: &str, todo: &NewTodo) -> Result<Todo, ApiError> {
        let request = self
            .http
            .post(self.url("todos/")?)
            .bearer_auth(token)
            .json(todo);
        send(request).await
    }

    /// Replace the todo with `todo.id` (`PUT /todos/{id}`).
    pub async fn update_todo(&self, token: &str, todo: &Todo) -> Result<Todo, ApiError> {
        let request = self
            .http
            .put(self.url(&format!("todos/{}", todo.id))?)
            .bearer_auth(token)
            .json(&NewTodo::from(todo));
        send(request).await
    }

    pub async fn delete_todo(&self, token: &str, id: i64) -> Result<Deleted, ApiError> {
        let request = self
            .http
            .delete(self.url(&format!("todos/{id}"))?)
            .bearer_auth(token);
        send(request).await
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
    }
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()));
    }

    let detail = match response.json::<ErrorBody>().await {
        Ok(ErrorBody {
            detail: serde_json::Value::String(detail),
        }) => detail,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };

    tracing::debug!(status = status.as_u16(), detail = %detail, "todo api request rejected");

    if status == StatusCode::UNAUTHORIZED {
        Err(ApiError::Unauthorized(detail))
    } else {
        Err(ApiError::Status {
            status: status.as_u16(),
            detail,
        })
    }
}
