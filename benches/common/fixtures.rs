use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use query_cache::todos::Todo;

/// Simulated todo API with configurable latency.
#[derive(Clone)]
pub struct FakeTodoServer {
    todos: Arc<Vec<Todo>>,
    latency_ms: u64,
    list_count: Arc<AtomicUsize>,
}

impl FakeTodoServer {
    pub fn new(num_todos: usize, latency_ms: u64) -> Self {
        let todos = (0..num_todos)
            .map(|i| Todo {
                id: i as i64,
                title: format!("Todo {}", i),
                description: Some(format!("Description {}", i)),
                completed: i % 3 == 0,
            })
            .collect();

        Self {
            todos: Arc::new(todos),
            latency_ms,
            list_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn list(&self) -> Vec<Todo> {
        self.list_count.fetch_add(1, Ordering::Relaxed);

        // Simulate network latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        self.todos.as_ref().clone()
    }

    #[allow(dead_code)]
    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::Relaxed)
    }
}

/// Generate session tokens for different workload patterns
pub struct TokenGenerator {
    num_tokens: usize,
}

impl TokenGenerator {
    pub fn new(num_tokens: usize) -> Self {
        Self { num_tokens }
    }

    /// Generate sequential tokens
    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_tokens).map(|i| format!("tok{}", i)).collect()
    }

    /// Generate tokens for mixed workload (some hits, some misses)
    pub fn mixed(&self, hit_ratio: f64) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot_count = ((self.num_tokens as f64 * hit_ratio) as usize).max(1);
        // Leave at least one cold token unless there is only one token.
        let hot_count = hot_count.min(self.num_tokens.saturating_sub(1)).max(1);

        (0..1000)
            .map(|_| {
                if hot_count >= self.num_tokens || rng.gen_bool(hit_ratio) {
                    format!("tok{}", rng.gen_range(0..hot_count))
                } else {
                    format!("tok{}", rng.gen_range(hot_count..self.num_tokens))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_todo_server() {
        use super::FakeTodoServer;

        let server = FakeTodoServer::new(10, 1);

        let todos = server.list().await;
        assert_eq!(todos.len(), 10);
        assert_eq!(server.list_count(), 1);
    }

    #[test]
    fn test_token_generator() {
        use super::TokenGenerator;

        let tokens = TokenGenerator::new(100);

        let seq = tokens.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0], "tok0");

        let mixed = tokens.mixed(0.8);
        assert_eq!(mixed.len(), 1000);
    }

    #[test]
    fn test_mixed_tokens_at_the_edges() {
        use super::TokenGenerator;

        let single = TokenGenerator::new(1).mixed(0.8);
        assert!(single.iter().all(|token| token == "tok0"));

        let all_hot = TokenGenerator::new(10).mixed(1.0);
        assert_eq!(all_hot.len(), 1000);
        assert!(all_hot.iter().all(|token| token != "tok9"));
    }
}
