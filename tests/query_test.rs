use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use query_cache::todos::{NewTodo, Todo};
use query_cache::{
    Mutation, QueryClient, QueryConfig, QueryError, QueryKey, QueryStatus, RetryPolicy,
};
use tokio::time::{advance, sleep};

type TestFetcher<V> =
    Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

fn client_with_stale_ms(stale_ms: u64) -> QueryClient {
    QueryClient::with_config(QueryConfig {
        stale_ms,
        ..QueryConfig::default()
    })
}

/// Counts invocations and answers with the invocation number after `delay`.
fn counting_fetcher(calls: &Arc<AtomicUsize>, delay: Duration) -> TestFetcher<usize> {
    let calls = calls.clone();
    Arc::new(move |_key| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            Ok(n)
        }
        .boxed()
    })
}

fn call<V: Send + 'static>(
    fetcher: &TestFetcher<V>,
) -> impl Fn(QueryKey) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync + use<V> {
    let fetcher = fetcher.clone();
    move |key| fetcher(key)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::from_millis(100));

    let subscriptions: Vec<_> = (0..5)
        .map(|_| client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap())
        .collect();
    let results = join_all((0..5).map(|_| client.fetch(["todos", "tok1"], call(&fetcher)))).await;

    assert!(results.iter().all(|result| *result == Ok(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for subscription in &subscriptions {
        assert_eq!(subscription.data(), Some(1));
    }
}

#[tokio::test]
async fn test_fresh_data_is_not_refetched() {
    let client = client_with_stale_ms(20_000);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::ZERO);

    let mut first = client.subscribe(["n"], call(&fetcher)).unwrap();
    first.settled().await;

    let second = client.subscribe(["n"], call(&fetcher)).unwrap();
    let third = client.subscribe(["n"], call(&fetcher)).unwrap();

    assert_eq!(second.data(), Some(1));
    assert_eq!(third.status(), QueryStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_data_is_served_while_revalidating() {
    let client = client_with_stale_ms(20_000);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::ZERO);

    let mut first = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    first.settled().await;

    advance(Duration::from_millis(19_999)).await;
    let within = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    assert_eq!(within.data(), Some(1));
    assert!(!within.entry().is_fetching());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    advance(Duration::from_millis(2)).await;
    let mut after = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    let entry = after.entry();
    assert_eq!(entry.data, Some(1));
    assert!(entry.is_fetching());
    assert!(!entry.is_loading());

    let entry = after.settled().await;
    assert_eq!(entry.data, Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_exhausted_before_error() {
    let client = QueryClient::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let a = attempts.clone();
    let mut subscription = client
        .subscribe_with(
            ["todos", "tok1"],
            move |_key| {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err::<Vec<Todo>, _>(QueryError::fetch("Failed to fetch todos")) }
            },
            client.default_options().retry(RetryPolicy::retries(2)),
        )
        .unwrap();

    let entry = subscription.settled().await;

    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.error, Some(QueryError::fetch("Failed to fetch todos")));
    assert_eq!(entry.failure_count, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_mutation_invalidation_forces_refetch() {
    let client = client_with_stale_ms(20_000);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::ZERO);

    assert_eq!(client.fetch(["todos", "tok1"], call(&fetcher)).await, Ok(1));

    let touch = Mutation::new(client.clone(), |_: ()| async { Ok(()) }).invalidates(["todos"]);
    touch.mutate(()).await.unwrap();

    let entry = client.entry::<usize>(["todos", "tok1"]).unwrap();
    assert!(entry.is_invalidated);

    let mut subscription = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    assert!(subscription.entry().is_fetching());
    let entry = subscription.settled().await;

    assert_eq!(entry.data, Some(2));
    assert!(!entry.is_invalidated);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_result_is_discarded() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    // The first request is slow, the second fast.
    let c = calls.clone();
    let mut subscription = client
        .subscribe(["n"], move |_key| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    sleep(Duration::from_millis(200)).await;
                    Ok("a")
                } else {
                    sleep(Duration::from_millis(50)).await;
                    Ok("b")
                }
            }
        })
        .unwrap();

    advance(Duration::from_millis(1)).await;
    let newer = subscription.refetch();

    let entry = subscription.settled().await;
    assert_eq!(entry.data, Some("b"));
    assert_eq!(newer.await, Ok("b"));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(subscription.data(), Some("b"));
    assert_eq!(subscription.status(), QueryStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_result_is_discarded() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::from_millis(100));

    let subscription = client.subscribe(["n"], call(&fetcher)).unwrap();
    drop(subscription);

    sleep(Duration::from_millis(200)).await;

    let entry = client.entry::<usize>(["n"]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entry.data, None);
    assert_eq!(entry.status, QueryStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_removed_key_ignores_late_result() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(&calls, Duration::from_millis(100));

    let subscription = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    assert_eq!(client.remove(["todos"]), 1);

    sleep(Duration::from_millis(200)).await;
    assert!(client.entry::<usize>(["todos", "tok1"]).is_none());
    assert_eq!(subscription.data(), None);

    // A new subscription starts from an empty entry.
    let mut fresh = client.subscribe(["todos", "tok1"], call(&fetcher)).unwrap();
    assert_eq!(fresh.settled().await.data, Some(2));
}

#[tokio::test]
async fn test_created_todo_appears_after_invalidation() {
    let client = client_with_stale_ms(20_000);
    let server: Arc<Mutex<Vec<Todo>>> = Arc::default();
    let list_calls = Arc::new(AtomicUsize::new(0));

    let list = {
        let server = server.clone();
        let list_calls = list_calls.clone();
        move |_key: QueryKey| {
            list_calls.fetch_add(1, Ordering::SeqCst);
            let todos = server.lock().unwrap().clone();
            async move { Ok(todos) }
        }
    };
    let create = {
        let server = server.clone();
        move |todo: NewTodo| {
            let mut todos = server.lock().unwrap();
            let created = Todo {
                id: todos.len() as i64 + 1,
                title: todo.title,
                description: todo.description,
                completed: todo.completed,
            };
            todos.push(created.clone());
            async move { Ok(created) }
        }
    };

    let mut todos = client.subscribe(["todos", "tok1"], list.clone()).unwrap();
    assert_eq!(todos.settled().await.data, Some(vec![]));

    let add = Mutation::new(client.clone(), create).invalidates(["todos"]);
    let created = add.mutate(NewTodo::new("Buy milk")).await.unwrap();
    assert!(add.state().is_success());
    assert!(client.entry::<Vec<Todo>>(["todos", "tok1"]).unwrap().is_invalidated);

    let mut next = client.subscribe(["todos", "tok1"], list).unwrap();
    let entry = next.settled().await;

    let titles: Vec<_> = entry.data.unwrap().into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["Buy milk".to_string()]);
    assert!(!created.completed);
    assert_eq!(list_calls.load(Ordering::SeqCst), 2);
}
