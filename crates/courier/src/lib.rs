//! # Courier
//!
//! A transport-agnostic message bus: services publish and send typed
//! messages, consume them through worker pools, retry or circuit-break on
//! failure, and drive long-running business processes with saga state
//! machines.
//!
//! ## Core Concepts
//!
//! - [`Message`] = a serde type with a stable message type name
//! - [`MessageEnvelope`] = one message on the wire, with identity, correlation and headers
//! - [`Consumer`] = handles one message type on a receive endpoint
//! - [`StateMachine`] = a saga: per-correlation state advanced by events
//! - [`Transport`] = the broker binding; [`InMemoryTransport`] is built in
//!
//! ## Architecture
//!
//! ```text
//! Bus::publish / send
//!     │
//!     ▼
//! Producer ──► PublishTransport / SendTransport
//!                     │
//!                     ▼ exchange fan-out / named queue
//!               ReceiveEndpoint (N workers)
//!                     │
//!                     ▼
//!               ReceivePipeline ──► expired? ──► drop
//!                     │
//!                     ▼
//!                Dispatcher ──┬─► consumer registration (retry ► breaker ► timeout ► Consumer)
//!                             └─► saga registration     (retry ► breaker ► timeout ► StateMachine)
//!                     │
//!                     ▼ on failure
//!               fault address / <queue>_error / <queue>_skipped
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Envelopes are immutable once sent** - `with_*` builders return new values
//! 2. **Correlation flows automatically** - follow-ups keep the correlation id and
//!    set the initiator to the inbound message id
//! 3. **Workers never die on one message** - failures are values, routed or logged
//! 4. **One saga instance, one handler at a time** - load, handle and save are
//!    serialized per correlation id
//! 5. **Saga messages after persistence** - a failed handler saves and publishes nothing
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: retries may run a consumer more than once
//! - **Failure isolation**: one failing consumer does not block the others on
//!   its endpoint
//! - **FIFO per queue per worker** only; no global ordering
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::{async_trait, impl_message, BusBuilder, ConsumeContext, Consumer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: uuid::Uuid,
//! }
//! impl_message!(OrderPlaced, "orders:OrderPlaced");
//!
//! struct OrderPlacedConsumer;
//!
//! #[async_trait]
//! impl Consumer<OrderPlaced> for OrderPlacedConsumer {
//!     async fn consume(&self, ctx: &ConsumeContext<OrderPlaced>) -> anyhow::Result<()> {
//!         tracing::info!(order_id = %ctx.message().order_id, "Order placed");
//!         Ok(())
//!     }
//! }
//!
//! let bus = BusBuilder::new()
//!     .add_consumer::<OrderPlaced, _>(OrderPlacedConsumer)
//!     .build()?;
//! bus.start().await?;
//! bus.publish(&OrderPlaced { order_id: uuid::Uuid::new_v4() }).await?;
//! bus.stop().await?;
//! ```
//!
//! ## What This Is Not
//!
//! Courier is **not**:
//! - Exactly-once delivery
//! - A distributed transaction coordinator
//! - A BPMN-style orchestration language

// Core modules
mod address;
mod bus;
mod cancel;
mod envelope;
mod error;
mod id;
mod message;
mod message_macro;
mod producer;

pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod headers;
pub mod pipeline;
pub mod retry;
pub mod saga;
pub mod serialization;
pub mod transport;

// Re-export identity and envelope types
pub use address::EndpointAddress;
pub use envelope::{HostInfo, MessageEnvelope, DEFAULT_CONTENT_TYPE};
pub use headers::Headers;
pub use id::{ConversationId, CorrelationId, MessageId};
pub use message::{Message, MessageType, MessageTypes};

// Re-export error types
pub use error::{BusError, BusResult, ErrorKind};

// Re-export cancellation
pub use cancel::CancellationToken;

// Re-export policy types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{BusConfig, EndpointConfig, EndpointSettings};
pub use retry::{RetryContext, RetryPolicy};

// Re-export consumer types
pub use consumer::{ConsumeContext, Consumer, ConsumerDefinition, Fault};

// Re-export saga types
pub use saga::{
    Behavior, InMemorySagaRepository, SagaContext, SagaData, SagaHandler, SagaInstance, SagaRepository,
    State, StateMachine, StateMachineBuilder, UnmatchedEventPolicy,
};

// Re-export transport types
pub use transport::in_memory::InMemoryTransport;
pub use transport::{ReceiveEndpoint, Transport};

// Re-export bus types (primary entry point)
pub use bus::{Bus, BusBuilder, PublishOptions, ReceiveEndpointConfigurator};
pub use producer::{Producer, ScheduledMessage};

// Re-export commonly used external types
pub use async_trait::async_trait;
