use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::queue::InMemoryQueue;

/// Fan-out point named after a message type.
///
/// The broker gives every bound queue its own copy of each published
/// envelope. Unbinding only affects later publishes.
pub struct InMemoryExchange {
    name: String,
    bindings: DashMap<String, Arc<InMemoryQueue>>,
}

impl InMemoryExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&self, queue: Arc<InMemoryQueue>) {
        debug!(exchange = %self.name, queue = %queue.name(), "Binding queue");
        self.bindings.insert(queue.name().to_string(), queue);
    }

    /// Returns whether a binding was removed.
    pub fn unbind(&self, queue_name: &str) -> bool {
        self.bindings.remove(queue_name).is_some()
    }

    pub fn is_bound(&self, queue_name: &str) -> bool {
        self.bindings.contains_key(queue_name)
    }

    /// Snapshot of the currently bound queues.
    pub fn bound_queues(&self) -> Vec<Arc<InMemoryQueue>> {
        self.bindings.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl std::fmt::Debug for InMemoryExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryExchange")
            .field("name", &self.name)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_are_keyed_by_queue_name() {
        let exchange = InMemoryExchange::new("orders:OrderPlaced");
        for i in 0..3 {
            exchange.bind(Arc::new(InMemoryQueue::new(format!("q{i}"), None)));
        }
        exchange.bind(Arc::new(InMemoryQueue::new("q0", None)));
        assert_eq!(exchange.bound_queues().len(), 3);

        assert!(exchange.unbind("q1"));
        assert!(!exchange.unbind("q1"));
        assert!(!exchange.is_bound("q1"));
        let mut names: Vec<_> = exchange
            .bound_queues()
            .iter()
            .map(|queue| queue.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["q0", "q2"]);
    }
}
