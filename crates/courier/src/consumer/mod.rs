//! Consumers and endpoint-side dispatch.
//!
//! A [`Consumer<M>`] handles one message type. Registration is explicit:
//! each consumer becomes a [`TypedConsumerRegistration`] on an endpoint,
//! and the endpoint's [`Dispatcher`] routes envelopes by message type.
//!
//! # Example
//!
//! ```ignore
//! struct OrderPlacedConsumer;
//!
//! #[async_trait]
//! impl Consumer<OrderPlaced> for OrderPlacedConsumer {
//!     async fn consume(&self, ctx: &ConsumeContext<OrderPlaced>) -> anyhow::Result<()> {
//!         ctx.publish(&InventoryReserved { order_id: ctx.message().order_id }).await?;
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod definition;
mod dispatcher;
mod fault;
mod receive;
mod registration;

pub use context::{ConsumeContext, DeliveryContext, ReceiveScope, TelemetryContext};
pub use definition::{endpoint_name_for, kebab_case, ConsumerDefinition};
pub use dispatcher::{DispatchFailure, Dispatcher};
pub use fault::{route_fault, route_skipped, ExceptionInfo, Fault};
pub use receive::{ExpirationFilter, ReceiveContext, ReceivePipeline};
pub use registration::{delivery_pipe, ConsumerRegistration, TypedConsumerRegistration};

use async_trait::async_trait;

use crate::message::Message;

/// Handles messages of type `M`.
///
/// Errors and panics are converted into bus errors at the dispatch
/// boundary; a [`BusError`](crate::BusError) returned through `anyhow`
/// keeps its identity.
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync + 'static {
    async fn consume(&self, ctx: &ConsumeContext<M>) -> anyhow::Result<()>;

    /// Name, endpoint and settings; defaults to the type name.
    fn definition(&self) -> ConsumerDefinition
    where
        Self: Sized,
    {
        ConsumerDefinition::for_type::<Self>()
    }
}
