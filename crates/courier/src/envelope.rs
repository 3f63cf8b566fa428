//! The message envelope.
//!
//! An envelope wraps a serialized message body with its routing and trace
//! metadata. Envelopes are immutable once handed to a transport; the `with_*`
//! methods consume and return the envelope so it can be finished before
//! sending.
//!
//! Causality travels through [`MessageEnvelope::create_follow_up`]: the
//! follow-up keeps the correlation id, records the causing message as its
//! initiator and receives a fresh message id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::EndpointAddress;
use crate::error::BusError;
use crate::headers::{self, Headers};
use crate::id::{ConversationId, CorrelationId, MessageId};
use crate::message::{Message, MessageType, MessageTypes};
use crate::serialization::{self, Serializer};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Information about the process that produced an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub machine_name: String,
    pub process_id: u32,
    pub framework: String,
    pub framework_version: String,
}

impl HostInfo {
    /// Describe the current process.
    pub fn current() -> Self {
        let machine_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            machine_name,
            process_id: std::process::id(),
            framework: env!("CARGO_PKG_NAME").to_string(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Serialized message plus routing and trace metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    message_id: MessageId,
    correlation_id: CorrelationId,
    conversation_id: Option<ConversationId>,
    initiator_id: Option<MessageId>,
    message_types: MessageTypes,
    body: Vec<u8>,
    content_type: String,
    headers: Headers,
    sent_time: DateTime<Utc>,
    source_address: Option<EndpointAddress>,
    destination_address: Option<EndpointAddress>,
    response_address: Option<EndpointAddress>,
    fault_address: Option<EndpointAddress>,
    expiration_time: Option<DateTime<Utc>>,
    host: Option<HostInfo>,
}

impl MessageEnvelope {
    /// Create a new envelope with a fresh message id.
    ///
    /// # Arguments
    ///
    /// * `message_types` - Type identifiers, most specific first
    /// * `body` - Serialized message
    /// * `correlation_id` - Causal group; a fresh id is generated when `None`
    pub fn create(
        message_types: MessageTypes,
        body: Vec<u8>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: correlation_id.unwrap_or_default(),
            conversation_id: None,
            initiator_id: None,
            message_types,
            body,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            headers: Headers::new(),
            sent_time: Utc::now(),
            source_address: None,
            destination_address: None,
            response_address: None,
            fault_address: None,
            expiration_time: None,
            host: None,
        }
    }

    /// Serialize a typed message into a new envelope.
    pub fn from_message<M: Message>(
        message: &M,
        serializer: &dyn Serializer,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Self, BusError> {
        let body = serialization::serialize(serializer, message)?;
        Ok(Self::create(M::message_types(), body, correlation_id)
            .with_content_type(serializer.content_type()))
    }

    /// Create an envelope caused by this one.
    ///
    /// Keeps the correlation and conversation ids and the propagated trace
    /// headers, sets the initiator to this envelope's message id and issues
    /// a fresh message id.
    pub fn create_follow_up(&self, message_types: MessageTypes, body: Vec<u8>) -> Self {
        let mut follow_up = Self::create(message_types, body, Some(self.correlation_id));
        follow_up.conversation_id = self.conversation_id;
        follow_up.initiator_id = Some(self.message_id);
        follow_up.content_type = self.content_type.clone();
        for key in headers::PROPAGATED {
            if let Some(value) = self.headers.get(key) {
                follow_up.headers.insert(key, value);
            }
        }
        follow_up
            .headers
            .insert(headers::INITIATOR_ID, self.message_id.to_string());
        follow_up
    }

    /// Typed variant of [`create_follow_up`](Self::create_follow_up).
    pub fn follow_up_message<M: Message>(
        &self,
        message: &M,
        serializer: &dyn Serializer,
    ) -> Result<Self, BusError> {
        let body = serialization::serialize(serializer, message)?;
        Ok(self
            .create_follow_up(M::message_types(), body)
            .with_content_type(serializer.content_type()))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn initiator_id(&self) -> Option<MessageId> {
        self.initiator_id
    }

    pub fn message_types(&self) -> &[MessageType] {
        &self.message_types
    }

    /// Most specific message type, if any.
    pub fn primary_type(&self) -> Option<&MessageType> {
        self.message_types.first()
    }

    pub fn supports(&self, message_type: &MessageType) -> bool {
        self.message_types.contains(message_type)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn sent_time(&self) -> DateTime<Utc> {
        self.sent_time
    }

    pub fn source_address(&self) -> Option<&EndpointAddress> {
        self.source_address.as_ref()
    }

    pub fn destination_address(&self) -> Option<&EndpointAddress> {
        self.destination_address.as_ref()
    }

    pub fn response_address(&self) -> Option<&EndpointAddress> {
        self.response_address.as_ref()
    }

    pub fn fault_address(&self) -> Option<&EndpointAddress> {
        self.fault_address.as_ref()
    }

    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        self.expiration_time
    }

    pub fn host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    /// Whether the envelope's time to live has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|expires| expires <= now)
    }

    // ------------------------------------------------------------------
    // Builders (before sending)
    // ------------------------------------------------------------------

    pub fn with_conversation_id(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_headers(mut self, headers: &Headers) -> Self {
        for (key, value) in headers.iter() {
            self.headers.insert(key, value);
        }
        self
    }

    pub fn with_source_address(mut self, address: EndpointAddress) -> Self {
        self.source_address = Some(address);
        self
    }

    pub fn with_destination_address(mut self, address: EndpointAddress) -> Self {
        self.destination_address = Some(address);
        self
    }

    pub fn with_response_address(mut self, address: EndpointAddress) -> Self {
        self.response_address = Some(address);
        self
    }

    pub fn with_fault_address(mut self, address: EndpointAddress) -> Self {
        self.fault_address = Some(address);
        self
    }

    pub fn with_expiration_time(mut self, expires: DateTime<Utc>) -> Self {
        self.expiration_time = Some(expires);
        self
    }

    /// Expire the envelope `ttl` after its sent time.
    pub fn with_time_to_live(mut self, ttl: std::time::Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.expiration_time = self
            .sent_time
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms));
        self.headers.insert(headers::TIME_TO_LIVE, ttl_ms.to_string());
        self
    }

    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = Some(host);
        self
    }
}
