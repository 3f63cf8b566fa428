use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::exchange::InMemoryExchange;
use super::queue::InMemoryQueue;
use crate::envelope::MessageEnvelope;
use crate::error::BusResult;
use crate::message::MessageType;

/// Queues and exchanges of one in-memory transport.
///
/// Both are created on first use. Separate brokers share nothing.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<InMemoryQueue>>,
    exchanges: DashMap<String, Arc<InMemoryExchange>>,
    default_capacity: Option<usize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose lazily created queues hold at most `capacity` envelopes.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            default_capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn queue(&self, name: &str) -> Arc<InMemoryQueue> {
        self.queue_with_capacity(name, self.default_capacity)
    }

    /// Get or create a queue; `capacity` only applies on creation.
    pub fn queue_with_capacity(&self, name: &str, capacity: Option<usize>) -> Arc<InMemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = %name, ?capacity, "Creating queue");
                Arc::new(InMemoryQueue::new(name, capacity))
            })
            .clone()
    }

    pub fn find_queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    pub fn exchange(&self, name: &str) -> Arc<InMemoryExchange> {
        self.exchanges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryExchange::new(name)))
            .clone()
    }

    pub fn bind(&self, message_type: &MessageType, queue: Arc<InMemoryQueue>) {
        self.exchange(message_type.as_str()).bind(queue);
    }

    pub fn unbind(&self, message_type: &MessageType, queue_name: &str) -> bool {
        self.exchanges
            .get(message_type.as_str())
            .is_some_and(|exchange| exchange.unbind(queue_name))
    }

    /// Enqueue on the named queue, creating it if needed.
    pub async fn send(&self, queue_name: &str, envelope: MessageEnvelope) -> BusResult<()> {
        self.queue(queue_name).enqueue(envelope).await
    }

    /// Deliver one copy to each distinct queue bound to any of the
    /// envelope's message types. Returns the number of copies.
    pub async fn publish(&self, envelope: &MessageEnvelope) -> BusResult<usize> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for message_type in envelope.message_types() {
            let Some(exchange) = self
                .exchanges
                .get(message_type.as_str())
                .map(|entry| entry.value().clone())
            else {
                continue;
            };
            for queue in exchange.bound_queues() {
                if seen.insert(queue.name().to_string()) {
                    targets.push(queue);
                }
            }
        }

        if targets.is_empty() {
            debug!(
                message_id = %envelope.message_id(),
                message_type = ?envelope.primary_type().map(MessageType::as_str),
                "No subscribers, message dropped"
            );
            return Ok(0);
        }
        for queue in &targets {
            queue.enqueue(envelope.clone()).await?;
        }
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn envelope(types: &[&'static str]) -> MessageEnvelope {
        MessageEnvelope::create(
            types.iter().map(|t| MessageType::from(*t)).collect(),
            b"{}".to_vec(),
            None,
        )
    }

    #[test]
    fn test_get_or_create_returns_same_queue() {
        let broker = InMemoryBroker::new();
        let a = broker.queue("orders");
        let b = broker.queue("orders");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(broker.find_queue("missing").is_none());
    }

    #[test]
    fn test_brokers_are_isolated() {
        let one = InMemoryBroker::new();
        let two = InMemoryBroker::new();
        assert!(!Arc::ptr_eq(&one.queue("orders"), &two.queue("orders")));
    }

    #[tokio::test]
    async fn test_publish_delivers_once_per_queue() {
        let broker = InMemoryBroker::new();
        let queue = broker.queue("audit");
        broker.bind(&MessageType::from("orders:OrderPlaced"), queue.clone());
        broker.bind(&MessageType::from("orders:OrderEvent"), queue.clone());

        let copies = broker
            .publish(&envelope(&["orders:OrderPlaced", "orders:OrderEvent"]))
            .await
            .unwrap();
        assert_eq!(copies, 1);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_bindings_is_dropped() {
        let broker = InMemoryBroker::new();
        let copies = broker.publish(&envelope(&["nobody:Listens"])).await.unwrap();
        assert_eq!(copies, 0);
    }

    #[tokio::test]
    async fn test_unbind_stops_future_deliveries() {
        let broker = InMemoryBroker::new();
        let message_type = MessageType::from("orders:OrderPlaced");
        let queue = broker.queue("billing");
        broker.bind(&message_type, queue.clone());
        broker.publish(&envelope(&["orders:OrderPlaced"])).await.unwrap();

        assert!(broker.unbind(&message_type, "billing"));
        broker.publish(&envelope(&["orders:OrderPlaced"])).await.unwrap();
        assert_eq!(queue.depth(), 1);

        broker
            .send("billing", MessageEnvelope::create(smallvec![message_type], Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(queue.depth(), 2);
    }
}
