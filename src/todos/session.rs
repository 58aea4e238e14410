use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::client::QueryClient;
use crate::config::QueryOptions;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::mutation::Mutation;
use crate::subscription::QuerySubscription;
use crate::todos::api::{ApiError, TodoApi};
use crate::todos::types::{Credentials, Deleted, NewTodo, RegisteredUser, Todo, Token};

/// How long a fetched todo list stays fresh.
pub const TODOS_STALE_TIME: Duration = Duration::from_secs(20);

/// Retries for a failed todo list fetch.
pub const TODOS_RETRIES: usize = 2;

/// Calls a [`TodoSession`] makes against the todo API.
#[async_trait]
pub trait TodoBackend: Send + Sync + 'static {
    async fn login(&self, credentials: &Credentials) -> Result<Token, ApiError>;

    async fn register(&self, credentials: &Credentials) -> Result<RegisteredUser, ApiError>;

    async fn list_todos(&self, token: &str) -> Result<Vec<Todo>, ApiError>;

    async fn create_todo(&self, token: &str, todo: &NewTodo) -> Result<Todo, ApiError>;

    async fn update_todo(&self, token: &str, todo: &Todo) -> Result<Todo, ApiError>;

    async fn delete_todo(&self, token: &str, id: i64) -> Result<Deleted, ApiError>;
}

#[async_trait]
impl TodoBackend for TodoApi {
    async fn login(&self, credentials: &Credentials) -> Result<Token, ApiError> {
        TodoApi::login(self, credentials).await
    }

    async fn register(&self, credentials: &Credentials) -> Result<RegisteredUser, ApiError> {
        TodoApi::register(self, credentials).await
    }

    async fn list_todos(&self, token: &str) -> Result<Vec<Todo>, ApiError> {
        TodoApi::list_todos(self, token).await
    }

    async fn create_todo(&self, token: &str, todo: &NewTodo) -> Result<Todo, ApiError> {
        TodoApi::create_todo(self, token, todo).await
    }

    async fn update_todo(&self, token: &str, todo: &Todo) -> Result<Todo, ApiError> {
        TodoApi::update_todo(self, token, todo).await
    }

    async fn delete_todo(&self, token: &str, id: i64) -> Result<Deleted, ApiError> {
        TodoApi::delete_todo(self, token, id).await
    }
}

/// The todo list of one logged-in user, backed by a shared [`QueryClient`].
///
/// The list is cached under `["todos", token]`. Every write invalidates `["todos"]`, so the
/// next subscription refetches. The token itself is the caller's to persist.
pub struct TodoSession<B: TodoBackend> {
    client: QueryClient,
    backend: Arc<B>,
    token: String,
    add: Mutation<NewTodo, Todo>,
    update: Mutation<Todo, Todo>,
    delete: Mutation<i64, Deleted>,
}

impl<B: TodoBackend> TodoSession<B> {
    /// Resume a session with a token obtained earlier.
    pub fn new(client: QueryClient, backend: Arc<B>, token: impl Into<String>) -> Self {
        let token = token.into();

        let add = {
            let backend = backend.clone();
            let token = token.clone();
            Mutation::new(client.clone(), move |todo: NewTodo| {
                let backend = backend.clone();
                let token = token.clone();
                async move {
                    backend
                        .create_todo(&token, &todo)
                        .await
                        .map_err(ApiError::into_mutation_error)
                }
            })
            .invalidates(["todos"])
        };

        let update = {
            let backend = backend.clone();
            let token = token.clone();
            Mutation::new(client.clone(), move |todo: Todo| {
                let backend = backend.clone();
                let token = token.clone();
                async move {
                    backend
                        .update_todo(&token, &todo)
                        .await
                        .map_err(ApiError::into_mutation_error)
                }
            })
            .invalidates(["todos"])
        };

        let delete = {
            let backend = backend.clone();
            let token = token.clone();
            Mutation::new(client.clone(), move |id: i64| {
                let backend = backend.clone();
                let token = token.clone();
                async move {
                    backend
                        .delete_todo(&token, id)
                        .await
                        .map_err(ApiError::into_mutation_error)
                }
            })
            .invalidates(["todos"])
        };

        TodoSession {
            client,
            backend,
            token,
            add,
            update,
            delete,
        }
    }

    /// Log in and start a session with the issued token.
    pub async fn login(
        client: QueryClient,
        backend: Arc<B>,
        credentials: &Credentials,
    ) -> Result<Self, QueryError> {
        let token = backend
            .login(credentials)
            .await
            .map_err(ApiError::into_mutation_error)?;

        tracing::info!(username = %credentials.username, "logged in");
        Ok(Self::new(client, backend, token.access_token))
    }

    /// Create an account, then log in with it.
    pub async fn register(
        client: QueryClient,
        backend: Arc<B>,
        credentials: &Credentials,
    ) -> Result<Self, QueryError> {
        let user = backend
            .register(credentials)
            .await
            .map_err(ApiError::into_mutation_error)?;

        tracing::info!(user_id = user.id, username = %user.username, "registered");
        Self::login(client, backend, credentials).await
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn todos_key(&self) -> QueryKey {
        QueryKey::from(["todos", self.token.as_str()])
    }

    /// Options for the todo list query. Without a token the query is disabled.
    ///
    /// Backoff delays follow the client's retry policy.
    pub fn todos_options(&self) -> QueryOptions {
        let mut options = self
            .client
            .default_options()
            .stale_time(TODOS_STALE_TIME)
            .enabled(!self.token.is_empty());
        options.retry.max_retries = TODOS_RETRIES;
        options
    }

    /// Subscribe to the todo list.
    pub fn todos(&self) -> Result<QuerySubscription<Vec<Todo>>, QueryError> {
        self.client
            .subscribe_with(self.todos_key(), self.list_fetcher(), self.todos_options())
    }

    /// Current todo list: cached if fresh, otherwise fetched.
    pub async fn load_todos(&self) -> Result<Vec<Todo>, QueryError> {
        self.client
            .fetch_with(self.todos_key(), self.list_fetcher(), self.todos_options())
            .await
    }

    fn list_fetcher(
        &self,
    ) -> impl Fn(QueryKey) -> BoxFuture<'static, Result<Vec<Todo>, QueryError>> + Send + Sync + use<B>
    {
        let backend = self.backend.clone();
        let token = self.token.clone();

        move |_key| {
            let backend = backend.clone();
            let token = token.clone();
            async move {
                backend
                    .list_todos(&token)
                    .await
                    .map_err(ApiError::into_fetch_error)
            }
            .boxed()
        }
    }

    pub async fn add(&self, todo: NewTodo) -> Result<Todo, QueryError> {
        self.add.mutate(todo).await
    }

    pub async fn update(&self, todo: Todo) -> Result<Todo, QueryError> {
        self.update.mutate(todo).await
    }

    /// Flip `completed` on `todo`.
    pub async fn toggle(&self, todo: &Todo) -> Result<Todo, QueryError> {
        self.update.mutate(todo.toggled()).await
    }

    pub async fn delete(&self, id: i64) -> Result<Deleted, QueryError> {
        self.delete.mutate(id).await
    }

    pub fn add_mutation(&self) -> &Mutation<NewTodo, Todo> {
        &self.add
    }

    pub fn update_mutation(&self) -> &Mutation<Todo, Todo> {
        &self.update
    }

    pub fn delete_mutation(&self) -> &Mutation<i64, Deleted> {
        &self.delete
    }

    /// End the session and drop every cached todo list.
    pub fn logout(self) -> usize {
        let removed = self.client.remove(["todos"]);
        tracing::info!(removed, "logged out");
        removed
    }
}
