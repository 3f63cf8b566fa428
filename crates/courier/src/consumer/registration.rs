use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::debug;

use super::context::{ConsumeContext, DeliveryContext, ReceiveScope};
use super::definition::ConsumerDefinition;
use super::Consumer;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerFilter};
use crate::config::EndpointConfig;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::message::{Message, MessageType};
use crate::pipeline::{Pipe, PipeContext, Terminal, TimeoutFilter};
use crate::retry::RetryFilter;
use crate::serialization;

/// One consumer (or saga) bound to an endpoint.
#[async_trait]
pub trait ConsumerRegistration: Send + Sync {
    fn name(&self) -> &str;

    /// Message types routed to this registration.
    fn message_types(&self) -> &[MessageType];

    /// Process `envelope`, including retries.
    ///
    /// Errors are wrapped in [`BusError::ConsumerFailed`] naming this registration.
    async fn consume(&self, envelope: &MessageEnvelope, scope: &ReceiveScope) -> BusResult<()>;

    /// Whether the endpoint should move exhausted messages to its error queue.
    fn use_error_queue(&self) -> bool;
}

/// Retry, circuit breaker and timeout filters for one registration.
///
/// `name` labels the circuit breaker.
pub fn delivery_pipe(name: &str, config: &EndpointConfig) -> Pipe<DeliveryContext> {
    let mut builder = Pipe::builder().add_filter(RetryFilter::new(config.retry));
    if let Some(breaker) = config.circuit_breaker {
        builder = builder.add_filter(CircuitBreakerFilter::new(Arc::new(CircuitBreaker::new(name, breaker))));
    }
    if let Some(timeout) = config.timeout {
        builder = builder.add_filter(TimeoutFilter::new(timeout));
    }
    builder.build()
}

/// Statically typed registration of consumer `C` for message `M`.
pub struct TypedConsumerRegistration<M, C> {
    name: String,
    consumer: Arc<C>,
    message_types: Vec<MessageType>,
    pipe: Pipe<DeliveryContext>,
    limiter: Option<Arc<Semaphore>>,
    use_error_queue: bool,
    _message: PhantomData<fn() -> M>,
}

impl<M, C> TypedConsumerRegistration<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    /// # Arguments
    ///
    /// * `consumer` - The consumer instance, shared by all workers
    /// * `definition` - Name and concurrency limit
    /// * `config` - Resolved settings for this registration
    pub fn new(consumer: C, definition: &ConsumerDefinition, config: &EndpointConfig) -> Self {
        Self {
            name: definition.name().to_string(),
            consumer: Arc::new(consumer),
            message_types: vec![M::message_type()],
            pipe: delivery_pipe(definition.name(), config),
            limiter: definition
                .concurrency_limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            use_error_queue: config.use_error_queue,
            _message: PhantomData,
        }
    }

    pub fn pipe(&self) -> &Pipe<DeliveryContext> {
        &self.pipe
    }

    fn failed(&self, error: BusError) -> BusError {
        BusError::ConsumerFailed {
            consumer: self.name.clone(),
            errors: vec![error],
        }
    }
}

#[async_trait]
impl<M, C> ConsumerRegistration for TypedConsumerRegistration<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn message_types(&self) -> &[MessageType] {
        &self.message_types
    }

    fn use_error_queue(&self) -> bool {
        self.use_error_queue
    }

    async fn consume(&self, envelope: &MessageEnvelope, scope: &ReceiveScope) -> BusResult<()> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await.map_err(|_| BusError::Cancelled)?),
            None => None,
        };

        let message: M = serialization::deserialize(scope.serializer(), envelope.body(), M::MESSAGE_TYPE)
            .map_err(|e| self.failed(e))?;
        let terminal = ConsumerTerminal {
            consumer: self.consumer.as_ref(),
            message: Arc::new(message),
            _message: PhantomData,
        };

        let mut ctx = DeliveryContext::new(envelope.clone(), scope.clone());
        debug!(consumer = %self.name, message_id = %envelope.message_id(), "Consuming message");
        self.pipe
            .send(&mut ctx, &terminal)
            .await
            .map_err(|e| self.failed(e))
    }
}

struct ConsumerTerminal<'a, M, C> {
    consumer: &'a C,
    message: Arc<M>,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<'a, M, C> Terminal<DeliveryContext> for ConsumerTerminal<'a, M, C>
where
    M: Message,
    C: Consumer<M>,
{
    async fn call(&self, ctx: &mut DeliveryContext) -> BusResult<()> {
        let payload = std::mem::take(ctx.base_mut().payload_mut());
        let consume_ctx = ConsumeContext::new(self.message.clone(), ctx.envelope().clone(), ctx.scope(), payload);

        let outcome = AssertUnwindSafe(self.consumer.consume(&consume_ctx))
            .catch_unwind()
            .await;
        *ctx.base_mut().payload_mut() = consume_ctx.into_payload();

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(BusError::from_anyhow(error)),
            Err(panic) => Err(BusError::failure("consumer.panic", panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("consumer panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("consumer panicked: {message}")
    } else {
        "consumer panicked".to_string()
    }
}
