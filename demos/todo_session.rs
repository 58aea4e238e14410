//! Walk through a todo session against a running todo API.
//!
//! Reads the API location from `TODO_API_URL` (default `http://localhost:8000`) and the
//! account from `TODO_USERNAME` / `TODO_PASSWORD`. The account is registered if logging in
//! fails. Set `RUST_LOG=query_cache=debug` to watch the cache transitions.

use std::sync::Arc;

use query_cache::todos::{Credentials, NewTodo, TodoApi, TodoSession};
use query_cache::{QueryClient, QueryConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todo_session=info,query_cache=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let api = Arc::new(TodoApi::from_env()?);
    println!("Using todo API at {}", api.config().base_url);

    let credentials = Credentials::new(
        std::env::var("TODO_USERNAME").unwrap_or_else(|_| "demo".to_string()),
        std::env::var("TODO_PASSWORD").unwrap_or_else(|_| "demo-password".to_string()),
    );

    let client = QueryClient::with_config(QueryConfig::default());
    let session = match TodoSession::login(client.clone(), api.clone(), &credentials).await {
        Ok(session) => session,
        Err(err) if err.is_unauthorized() => {
            println!("Login failed, registering {}", credentials.username);
            TodoSession::register(client.clone(), api, &credentials).await?
        }
        Err(err) => return Err(err.into()),
    };

    // Subscribing returns at once; the list arrives in the background.
    let mut todos = session.todos()?;
    println!("Loading: {}", todos.entry().is_loading());
    let entry = todos.settled().await;
    println!("{} todos on the server", entry.data.map_or(0, |t| t.len()));

    // A second subscriber within 20 seconds is served from cache.
    let cached = session.todos()?;
    println!("Cached read fetching: {}", cached.entry().is_fetching());

    let created = session
        .add(NewTodo::new("Buy milk").with_description("2 liters"))
        .await?;
    println!("Created #{} {:?}", created.id, created.title);

    // The write marked the list stale, so this refetches.
    let list = session.load_todos().await?;
    for todo in &list {
        let mark = if todo.completed { "x" } else { " " };
        println!("  [{}] {} {}", mark, todo.id, todo.title);
    }

    let toggled = session.toggle(&created).await?;
    println!("Completed #{}: {}", toggled.id, toggled.completed);

    let deleted = session.delete(created.id).await?;
    println!("{}", deleted.message);

    drop((todos, cached));
    let removed = session.logout();
    println!("Logged out, dropped {} cached lists", removed);

    Ok(())
}
