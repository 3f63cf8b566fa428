//! Transport abstraction.
//!
//! A broker binding implements the [`Transport`] trait family:
//!
//! ```text
//! Transport
//!   ├── send_transport(address)   ─► SendTransport    (point-to-point)
//!   ├── publish_transport()       ─► PublishTransport (fan-out by message type)
//!   └── create_receive_endpoint() ─► ReceiveEndpoint  (workers ─► EnvelopeDispatcher)
//! ```
//!
//! The transport only moves envelopes. Decoding, retries and consumer
//! routing happen behind the [`EnvelopeDispatcher`] handed to each receive
//! endpoint. [`in_memory`] is the reference implementation.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::config::EndpointConfig;
use crate::envelope::MessageEnvelope;
use crate::error::BusResult;
use crate::message::MessageType;

/// Broker binding.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address scheme served by this transport, e.g. `inmemory`.
    fn scheme(&self) -> &str;

    /// Address of a named queue on this transport.
    fn address(&self, name: &str) -> BusResult<EndpointAddress> {
        EndpointAddress::new(self.scheme(), name)
    }

    /// Create (but do not start) a receive endpoint for `address`.
    async fn create_receive_endpoint(
        &self,
        address: EndpointAddress,
        config: EndpointConfig,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
    ) -> BusResult<Arc<dyn ReceiveEndpoint>>;

    async fn send_transport(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>>;

    async fn publish_transport(&self) -> BusResult<Arc<dyn PublishTransport>>;
}

/// Delivers envelopes to one destination queue.
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn address(&self) -> &EndpointAddress;

    /// Enqueue `envelope`; may wait for capacity on bounded queues.
    async fn send(&self, envelope: MessageEnvelope, cancellation: &CancellationToken) -> BusResult<()>;
}

/// Delivers envelopes to every queue subscribed to their message types.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(&self, envelope: MessageEnvelope, cancellation: &CancellationToken) -> BusResult<()>;
}

/// A queue with workers feeding an [`EnvelopeDispatcher`].
#[async_trait]
pub trait ReceiveEndpoint: Send + Sync {
    fn address(&self) -> &EndpointAddress;

    /// Bind subscriptions and spawn workers.
    ///
    /// Fails with `EndpointAlreadyRunning` if already started.
    async fn start(&self) -> BusResult<()>;

    /// Stop accepting messages and wait for in-flight ones to finish.
    ///
    /// Stopping a stopped endpoint does nothing.
    async fn stop(&self) -> BusResult<()>;

    fn is_running(&self) -> bool;
}

/// Receives every envelope dequeued by an endpoint's workers.
#[async_trait]
pub trait EnvelopeDispatcher: Send + Sync {
    /// Message types the endpoint's queue should be bound to.
    fn subscriptions(&self) -> Vec<MessageType>;

    async fn dispatch(&self, envelope: MessageEnvelope, cancellation: CancellationToken) -> BusResult<()>;
}
