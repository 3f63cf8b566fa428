//! In-memory reference transport.
//!
//! ```text
//! publish(OrderPlaced) ─► exchange "orders:OrderPlaced" ─┬─► queue "billing"   ─► workers
//!                                                        └─► queue "shipping"  ─► workers
//! send(inmemory://audit) ─────────────────────────────────► queue "audit"     ─► workers
//! ```
//!
//! Every [`InMemoryTransport`] owns its own [`InMemoryBroker`], so two buses
//! in one process never see each other's messages.

mod broker;
mod endpoint;
mod exchange;
mod queue;

pub use broker::InMemoryBroker;
pub use endpoint::InMemoryReceiveEndpoint;
pub use exchange::InMemoryExchange;
pub use queue::InMemoryQueue;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::config::EndpointConfig;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::transport::{EnvelopeDispatcher, PublishTransport, ReceiveEndpoint, SendTransport, Transport};

pub const SCHEME: &str = "inmemory";

#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose lazily created queues are bounded.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::bounded(capacity)),
        }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    fn check_scheme(&self, address: &EndpointAddress) -> BusResult<()> {
        if address.scheme() == SCHEME {
            Ok(())
        } else {
            Err(BusError::InvalidAddress {
                value: address.to_string(),
                reason: format!("expected scheme '{SCHEME}'"),
            })
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn create_receive_endpoint(
        &self,
        address: EndpointAddress,
        config: EndpointConfig,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
    ) -> BusResult<Arc<dyn ReceiveEndpoint>> {
        self.check_scheme(&address)?;
        let queue = self
            .broker
            .queue_with_capacity(address.name(), config.queue_capacity);
        debug!(endpoint = %address, workers = config.worker_count(), "Creating receive endpoint");
        Ok(Arc::new(InMemoryReceiveEndpoint::new(
            address,
            queue,
            self.broker.clone(),
            dispatcher,
            config.worker_count(),
        )))
    }

    async fn send_transport(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>> {
        self.check_scheme(address)?;
        Ok(Arc::new(InMemorySendTransport {
            address: address.clone(),
            queue: self.broker.queue(address.name()),
        }))
    }

    async fn publish_transport(&self) -> BusResult<Arc<dyn PublishTransport>> {
        Ok(Arc::new(InMemoryPublishTransport {
            broker: self.broker.clone(),
        }))
    }
}

struct InMemorySendTransport {
    address: EndpointAddress,
    queue: Arc<InMemoryQueue>,
}

#[async_trait]
impl SendTransport for InMemorySendTransport {
    fn address(&self) -> &EndpointAddress {
        &self.address
    }

    async fn send(&self, envelope: MessageEnvelope, cancellation: &CancellationToken) -> BusResult<()> {
        if cancellation.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let envelope = envelope.with_destination_address(self.address.clone());
        debug!(destination = %self.address, message_id = %envelope.message_id(), "Sending message");
        tokio::select! {
            result = self.queue.enqueue(envelope) => result,
            _ = cancellation.cancelled() => Err(BusError::Cancelled),
        }
    }
}

struct InMemoryPublishTransport {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl PublishTransport for InMemoryPublishTransport {
    async fn publish(&self, envelope: MessageEnvelope, cancellation: &CancellationToken) -> BusResult<()> {
        if cancellation.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let copies = tokio::select! {
            result = self.broker.publish(&envelope) => result?,
            _ = cancellation.cancelled() => return Err(BusError::Cancelled),
        };
        debug!(message_id = %envelope.message_id(), copies, "Published message");
        Ok(())
    }
}
