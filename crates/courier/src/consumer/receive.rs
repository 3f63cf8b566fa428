//! Endpoint-level receive pipeline.
//!
//! ```text
//! worker ─► LoggingFilter ─► ExpirationFilter ─► Dispatcher ─┬─► registration A (retry, breaker, timeout ─► consumer)
//!                                                              └─► registration B ...
//!                                         │
//!                        failure routing ◄┘ (fault address, _error, _skipped)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info_span, warn, Instrument};

use super::context::{ReceiveScope, TelemetryContext};
use super::dispatcher::{DispatchFailure, Dispatcher};
use super::fault;
use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::message::MessageType;
use crate::pipeline::{ContextBase, Filter, LoggingFilter, Next, Pipe, PipeContext, Terminal};
use crate::producer::Producer;
use crate::transport::EnvelopeDispatcher;

/// Pipeline context for one received envelope.
pub struct ReceiveContext {
    base: ContextBase,
    envelope: MessageEnvelope,
    failure: Option<DispatchFailure>,
}

impl ReceiveContext {
    pub fn new(envelope: MessageEnvelope, cancellation: CancellationToken) -> Self {
        Self {
            base: ContextBase::new(cancellation),
            envelope,
            failure: None,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }
}

impl PipeContext for ReceiveContext {
    fn base(&self) -> &ContextBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ContextBase {
        &mut self.base
    }
}

/// Drops expired envelopes before they reach any consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpirationFilter;

#[async_trait]
impl Filter<ReceiveContext> for ExpirationFilter {
    async fn send(&self, ctx: &mut ReceiveContext, next: Next<'_, ReceiveContext>) -> BusResult<()> {
        if let Some(expired_at) = ctx.envelope().expiration_time() {
            if ctx.envelope().is_expired(Utc::now()) {
                return Err(BusError::MessageExpired {
                    message_id: ctx.envelope().message_id(),
                    expired_at,
                });
            }
        }
        next.run(ctx).await
    }

    fn name(&self) -> &str {
        "expiration"
    }
}

/// Everything an endpoint's workers hand received envelopes to.
pub struct ReceivePipeline {
    address: EndpointAddress,
    dispatcher: Dispatcher,
    producer: Producer,
    pipe: Pipe<ReceiveContext>,
    use_error_queue: bool,
}

impl ReceivePipeline {
    pub fn new(address: EndpointAddress, dispatcher: Dispatcher, producer: Producer, use_error_queue: bool) -> Self {
        let pipe = Pipe::builder()
            .add_filter(LoggingFilter::new(address.to_string()))
            .add_filter(ExpirationFilter)
            .build();
        Self {
            address,
            dispatcher,
            producer,
            pipe,
            use_error_queue,
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn receive(&self, envelope: MessageEnvelope, cancellation: CancellationToken) -> BusResult<()> {
        let scope = ReceiveScope::new(
            self.address.clone(),
            self.producer.clone(),
            cancellation.clone(),
            TelemetryContext::from_headers(envelope.headers()),
        );
        let mut ctx = ReceiveContext::new(envelope, cancellation);
        let terminal = DispatchTerminal {
            dispatcher: &self.dispatcher,
            scope: &scope,
        };

        let result = self.pipe.send(&mut ctx, &terminal).await;
        let envelope = &ctx.envelope;
        match (result, ctx.failure.take()) {
            (Ok(()), _) => Ok(()),
            (Err(BusError::MessageExpired { message_id, expired_at }), _) => {
                warn!(%message_id, %expired_at, "Message expired, dropped");
                Ok(())
            }
            (Err(_), Some(DispatchFailure::Unmatched(reason))) => {
                fault::route_skipped(&scope, envelope, &reason).await
            }
            (Err(_), Some(DispatchFailure::Consumers(failures))) => {
                let use_error_queue =
                    self.use_error_queue && failures.iter().any(|(registration, _)| registration.use_error_queue());
                let error = DispatchFailure::Consumers(failures).into_error();
                fault::route_fault(&scope, envelope, &error, use_error_queue).await
            }
            (Err(error), None) => Err(error),
        }
    }
}

#[async_trait]
impl EnvelopeDispatcher for ReceivePipeline {
    fn subscriptions(&self) -> Vec<MessageType> {
        self.dispatcher.subscriptions()
    }

    async fn dispatch(&self, envelope: MessageEnvelope, cancellation: CancellationToken) -> BusResult<()> {
        let span = info_span!(
            "receive",
            endpoint = %self.address,
            message_id = %envelope.message_id(),
            correlation_id = %envelope.correlation_id(),
            message_type = %envelope.primary_type().map(MessageType::as_str).unwrap_or("<none>"),
        );
        self.receive(envelope, cancellation).instrument(span).await
    }
}

struct DispatchTerminal<'a> {
    dispatcher: &'a Dispatcher,
    scope: &'a ReceiveScope,
}

#[async_trait]
impl<'a> Terminal<ReceiveContext> for DispatchTerminal<'a> {
    async fn call(&self, ctx: &mut ReceiveContext) -> BusResult<()> {
        let scope = self.scope.with_cancellation(ctx.base().cancellation().clone());
        match self.dispatcher.dispatch(&ctx.envelope, &scope).await {
            Ok(_) => Ok(()),
            Err(failure) => {
                let error = match &failure {
                    DispatchFailure::Unmatched(error) => error.clone(),
                    DispatchFailure::Consumers(failures) => failures
                        .first()
                        .map(|(_, error)| error.clone())
                        .unwrap_or(BusError::Unexpected {
                            description: "dispatch failed without errors".to_string(),
                        }),
                };
                ctx.failure = Some(failure);
                Err(error)
            }
        }
    }
}
