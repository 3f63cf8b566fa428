use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::headers::{self, Headers};
use crate::id::{CorrelationId, MessageId};
use crate::message::Message;
use crate::pipeline::{ContextBase, Payload, PipeContext};
use crate::producer::{Producer, ScheduledMessage};
use crate::retry::RetryContext;
use crate::serialization::Serializer;

// ============================================================================
// Telemetry
// ============================================================================

/// Trace identity of the message being processed.
///
/// Read from the inbound headers; [`child`](Self::child) derives the identity
/// stamped on messages sent while processing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryContext {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    tenant_id: Option<String>,
}

impl TelemetryContext {
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            trace_id: headers
                .trace_id()
                .map(str::to_string)
                .unwrap_or_else(new_span_id),
            span_id: headers
                .get(headers::SPAN_ID)
                .map(str::to_string)
                .unwrap_or_else(new_span_id),
            parent_span_id: headers.get(headers::PARENT_SPAN_ID).map(str::to_string),
            tenant_id: headers.tenant_id().map(str::to_string),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Identity for an outgoing message: same trace, new span, parented here.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            tenant_id: self.tenant_id.clone(),
        }
    }

    pub fn apply(&self, envelope: MessageEnvelope) -> MessageEnvelope {
        let envelope = envelope
            .with_header(headers::TRACE_ID, self.trace_id.clone())
            .with_header(headers::SPAN_ID, self.span_id.clone());
        let envelope = match &self.parent_span_id {
            Some(parent) => envelope.with_header(headers::PARENT_SPAN_ID, parent.clone()),
            None => envelope,
        };
        match &self.tenant_id {
            Some(tenant) => envelope.with_header(headers::TENANT_ID, tenant.clone()),
            None => envelope,
        }
    }
}

fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Receive scope
// ============================================================================

/// Everything message processing needs from the receiving endpoint.
#[derive(Debug, Clone)]
pub struct ReceiveScope {
    address: EndpointAddress,
    producer: Producer,
    cancellation: CancellationToken,
    telemetry: TelemetryContext,
}

impl ReceiveScope {
    pub fn new(
        address: EndpointAddress,
        producer: Producer,
        cancellation: CancellationToken,
        telemetry: TelemetryContext,
    ) -> Self {
        Self {
            address,
            producer,
            cancellation,
            telemetry,
        }
    }

    /// Address of the receiving endpoint.
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.producer.serializer()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn telemetry(&self) -> &TelemetryContext {
        &self.telemetry
    }

    /// Same scope with a different cancellation token.
    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    /// Envelope for `message`, caused by `inbound`.
    ///
    /// Keeps the correlation and conversation, sets the initiator and
    /// parents the new span on the inbound one.
    pub fn follow_up<T: Message>(&self, inbound: &MessageEnvelope, message: &T) -> BusResult<MessageEnvelope> {
        let envelope = inbound
            .follow_up_message(message, self.serializer())?
            .with_source_address(self.address.clone())
            .with_host(self.producer.host().clone());
        Ok(self.telemetry.child().apply(envelope))
    }
}

// ============================================================================
// Delivery context
// ============================================================================

/// Pipeline context for one registration processing one envelope.
pub struct DeliveryContext {
    base: ContextBase,
    envelope: MessageEnvelope,
    scope: ReceiveScope,
}

impl DeliveryContext {
    pub fn new(envelope: MessageEnvelope, scope: ReceiveScope) -> Self {
        Self {
            base: ContextBase::new(scope.cancellation().child()),
            envelope,
            scope,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    /// Scope carrying this context's current cancellation token.
    pub fn scope(&self) -> ReceiveScope {
        self.scope.with_cancellation(self.base.cancellation().clone())
    }
}

impl PipeContext for DeliveryContext {
    fn base(&self) -> &ContextBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ContextBase {
        &mut self.base
    }
}

// ============================================================================
// Consume context
// ============================================================================

/// What a [`Consumer`](super::Consumer) sees for one message.
pub struct ConsumeContext<M> {
    message: Arc<M>,
    envelope: MessageEnvelope,
    scope: ReceiveScope,
    payload: Payload,
}

impl<M: Message> ConsumeContext<M> {
    pub fn new(message: Arc<M>, envelope: MessageEnvelope, scope: ReceiveScope, payload: Payload) -> Self {
        Self {
            message,
            envelope,
            scope,
            payload,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn message_id(&self) -> MessageId {
        self.envelope.message_id()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.envelope.correlation_id()
    }

    pub fn headers(&self) -> &Headers {
        self.envelope.headers()
    }

    pub fn telemetry(&self) -> &TelemetryContext {
        self.scope.telemetry()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.scope.cancellation()
    }

    /// Values placed by pipeline filters.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Zero-based delivery attempt.
    pub fn retry_attempt(&self) -> u32 {
        self.payload
            .get::<RetryContext>()
            .map(RetryContext::attempt)
            .unwrap_or(0)
    }

    /// Address of the endpoint that received this message.
    pub fn receive_address(&self) -> &EndpointAddress {
        self.scope.address()
    }

    /// Publish a message caused by this one.
    pub async fn publish<T: Message>(&self, message: &T) -> BusResult<()> {
        let envelope = self.scope.follow_up(&self.envelope, message)?;
        self.scope
            .producer()
            .publish_envelope(envelope, self.scope.cancellation())
            .await
    }

    /// Send a message caused by this one to `address`.
    pub async fn send<T: Message>(&self, address: &EndpointAddress, message: &T) -> BusResult<()> {
        let envelope = self.scope.follow_up(&self.envelope, message)?;
        self.scope
            .producer()
            .send_envelope(address, envelope, self.scope.cancellation())
            .await
    }

    /// Reply to the response address, or the source address if none was set.
    pub async fn respond<T: Message>(&self, message: &T) -> BusResult<()> {
        let address = self
            .envelope
            .response_address()
            .or(self.envelope.source_address())
            .cloned()
            .ok_or_else(|| BusError::DeliveryFailed {
                address: "<none>".to_string(),
                reason: format!("message {} has no response address", self.message_id()),
            })?;
        self.send(&address, message).await
    }

    /// Publish a message caused by this one after `delay`.
    pub fn schedule_publish<T: Message>(&self, message: &T, delay: Duration) -> BusResult<ScheduledMessage> {
        let envelope = self.scope.follow_up(&self.envelope, message)?;
        Ok(self.scope.producer().schedule_publish(envelope, delay))
    }

    pub(crate) fn into_payload(self) -> Payload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_span_parents_on_inbound() {
        let mut inbound_headers = Headers::new();
        inbound_headers.insert(headers::TRACE_ID, "trace-1");
        inbound_headers.insert(headers::SPAN_ID, "span-1");
        inbound_headers.insert(headers::TENANT_ID, "acme");

        let inbound = TelemetryContext::from_headers(&inbound_headers);
        let child = inbound.child();
        assert_eq!(child.trace_id(), "trace-1");
        assert_eq!(child.parent_span_id(), Some("span-1"));
        assert_eq!(child.tenant_id(), Some("acme"));
        assert_ne!(child.span_id(), "span-1");
    }

    #[test]
    fn test_missing_trace_starts_new_one() {
        let telemetry = TelemetryContext::from_headers(&Headers::new());
        assert_eq!(telemetry.trace_id().len(), 32);
        assert!(telemetry.parent_span_id().is_none());
    }
}
