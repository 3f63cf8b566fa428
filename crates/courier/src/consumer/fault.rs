//! Failure routing for messages that could not be consumed.
//!
//! ```text
//! exhausted ──┬─► fault address set?  ─► Fault follow-up to fault address
//!             └─► error queue enabled? ─► original + fault headers to <queue>_error
//!                                         (otherwise logged and dropped)
//! unknown type ─────────────────────────► original to <queue>_skipped
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::context::ReceiveScope;
use crate::envelope::{HostInfo, MessageEnvelope};
use crate::error::{BusError, BusResult};
use crate::headers;
use crate::id::MessageId;

/// Published to an envelope's fault address when processing fails for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub faulted_message_id: MessageId,
    pub message_types: Vec<String>,
    pub exceptions: Vec<ExceptionInfo>,
    pub timestamp: DateTime<Utc>,
    pub host: Option<HostInfo>,
    /// Original body when it was JSON
    pub message: Option<serde_json::Value>,
}

crate::impl_message!(Fault, "urn:message:courier:Fault");

/// One error in a [`Fault`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub code: String,
    pub kind: String,
    pub message: String,
}

impl From<&BusError> for ExceptionInfo {
    fn from(error: &BusError) -> Self {
        Self {
            code: error.code().to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

impl Fault {
    pub fn new(envelope: &MessageEnvelope, error: &BusError, host: Option<HostInfo>) -> Self {
        Self {
            faulted_message_id: envelope.message_id(),
            message_types: envelope
                .message_types()
                .iter()
                .map(ToString::to_string)
                .collect(),
            exceptions: error.root_causes().into_iter().map(ExceptionInfo::from).collect(),
            timestamp: Utc::now(),
            host,
            message: serde_json::from_slice(envelope.body()).ok(),
        }
    }
}

/// Route an envelope whose processing failed after all retries.
pub async fn route_fault(
    scope: &ReceiveScope,
    envelope: &MessageEnvelope,
    error: &BusError,
    use_error_queue: bool,
) -> BusResult<()> {
    let cause = error.root_causes().into_iter().next().unwrap_or(error);

    if let Some(fault_address) = envelope.fault_address() {
        let fault = Fault::new(envelope, error, Some(scope.producer().host().clone()));
        let fault_envelope = scope
            .follow_up(envelope, &fault)?
            .with_header(headers::FAULT_EXCEPTION_TYPE, cause.code())
            .with_header(headers::FAULT_REASON, cause.to_string());
        debug!(
            message_id = %envelope.message_id(),
            fault_address = %fault_address,
            "Sending fault"
        );
        scope
            .producer()
            .send_envelope(fault_address, fault_envelope, scope.cancellation())
            .await?;
    }

    if use_error_queue {
        let error_queue = scope.address().error_queue();
        warn!(
            message_id = %envelope.message_id(),
            error_queue = %error_queue,
            error = %error,
            "Moving faulted message to error queue"
        );
        let faulted = envelope
            .clone()
            .with_header(headers::FAULT_EXCEPTION_TYPE, cause.code())
            .with_header(headers::FAULT_REASON, cause.to_string());
        scope
            .producer()
            .send_envelope(&error_queue, faulted, scope.cancellation())
            .await?;
    } else {
        warn!(
            message_id = %envelope.message_id(),
            error = %error,
            "Message faulted, dropped"
        );
    }
    Ok(())
}

/// Move an envelope nothing on this endpoint could handle to `<queue>_skipped`.
pub async fn route_skipped(scope: &ReceiveScope, envelope: &MessageEnvelope, reason: &BusError) -> BusResult<()> {
    let skipped_queue = scope.address().skipped_queue();
    warn!(
        message_id = %envelope.message_id(),
        skipped_queue = %skipped_queue,
        reason = %reason,
        "Moving message to skipped queue"
    );
    scope
        .producer()
        .send_envelope(&skipped_queue, envelope.clone(), scope.cancellation())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use smallvec::smallvec;

    #[test]
    fn test_fault_describes_root_causes() {
        let envelope = MessageEnvelope::create(
            smallvec![MessageType::from("orders:OrderPlaced")],
            br#"{"order_id":7}"#.to_vec(),
            None,
        );
        let error = BusError::ConsumerFailed {
            consumer: "Billing".to_string(),
            errors: vec![BusError::RetryExhausted {
                attempts: 2,
                errors: vec![BusError::transport("a"), BusError::failure("billing.declined", "declined")],
            }],
        };

        let fault = Fault::new(&envelope, &error, None);
        assert_eq!(fault.faulted_message_id, envelope.message_id());
        assert_eq!(fault.message_types, vec!["orders:OrderPlaced"]);
        let codes: Vec<_> = fault.exceptions.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["courier.transport_error", "billing.declined"]);
        assert_eq!(fault.message.unwrap()["order_id"], 7);
    }
}
