//! Error types for the bus.
//!
//! Every failure the runtime produces is a [`BusError`] value. Each variant
//! maps onto one [`ErrorKind`] of the shared taxonomy and carries a stable
//! machine-readable code, so broker adapters and fault messages can report
//! failures without depending on the Rust type.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{CorrelationId, MessageId};

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Shared error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    BadRequest,
    Timeout,
    Gone,
    Locked,
    TooManyRequests,
    Unavailable,
    Failure,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Gone => "gone",
            ErrorKind::Locked => "locked",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Failure => "failure",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    /// Identifier text could not be parsed
    #[error("invalid identifier '{value}': {reason}")]
    InvalidId { value: String, reason: String },

    /// Endpoint address text could not be parsed
    #[error("invalid endpoint address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// No consumer is registered for any of the envelope's types
    #[error("no registration for message type(s) {}", .message_types.join(", "))]
    UnknownMessageType { message_types: Vec<String> },

    #[error("serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("deserialization of {message_type} failed: {reason}")]
    Deserialization { message_type: String, reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("operation timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// Cancellation requested by the caller
    #[error("operation cancelled")]
    Cancelled,

    #[error("circuit breaker is open, next trial in {}ms", .retry_after.as_millis())]
    CircuitBreakerOpen { retry_after: Duration },

    /// A consumer failed; wraps the inner errors with the consumer identity
    #[error("consumer {consumer} failed: {}", join_errors(.errors))]
    ConsumerFailed {
        consumer: String,
        errors: Vec<BusError>,
    },

    #[error("no saga instance for correlation id {correlation_id}")]
    SagaNotFound { correlation_id: CorrelationId },

    #[error("saga {correlation_id} was modified concurrently (expected version {expected}, found {actual})")]
    SagaConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: u64,
        actual: u64,
    },

    #[error("saga {correlation_id} in state {state} has no handler for {message_type}")]
    SagaEventUnmatched {
        correlation_id: CorrelationId,
        state: String,
        message_type: String,
    },

    /// Configuration error: the saga cannot correlate this message type
    #[error("no correlation extractor registered for {message_type}")]
    MissingCorrelation { message_type: String },

    #[error("invalid state machine {machine}: {reason}")]
    InvalidStateMachine { machine: String, reason: String },

    #[error("delivery to {address} failed: {reason}")]
    DeliveryFailed { address: String, reason: String },

    /// Retry policy gave up; carries every attempt's errors in order
    #[error("gave up after {attempts} attempt(s): {}", join_errors(.errors))]
    RetryExhausted { attempts: u32, errors: Vec<BusError> },

    #[error("message {message_id} expired at {expired_at}")]
    MessageExpired {
        message_id: MessageId,
        expired_at: DateTime<Utc>,
    },

    #[error("endpoint {address} is already running")]
    EndpointAlreadyRunning { address: String },

    /// Generic failure, typically converted from user code
    #[error("{description}")]
    Failure { code: String, description: String },

    #[error("unexpected error: {description}")]
    Unexpected { description: String },
}

fn join_errors(errors: &[BusError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BusError {
    /// Build a generic failure with a code.
    pub fn failure(code: impl Into<String>, description: impl Into<String>) -> Self {
        BusError::Failure {
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn transport(reason: impl fmt::Display) -> Self {
        BusError::Transport {
            reason: reason.to_string(),
        }
    }

    /// Convert an error returned by user code.
    ///
    /// A `BusError` travelling inside the `anyhow::Error` keeps its identity;
    /// anything else becomes a `Failure`.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<BusError>() {
            Ok(bus_error) => bus_error,
            Err(other) => BusError::Failure {
                code: "consumer.exception".to_string(),
                description: format!("{other:#}"),
            },
        }
    }

    /// Taxonomy category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::InvalidId { .. }
            | BusError::InvalidAddress { .. }
            | BusError::InvalidStateMachine { .. }
            | BusError::MissingCorrelation { .. } => ErrorKind::Validation,
            BusError::UnknownMessageType { .. } | BusError::SagaNotFound { .. } => {
                ErrorKind::NotFound
            }
            BusError::SagaConcurrencyConflict { .. }
            | BusError::SagaEventUnmatched { .. }
            | BusError::EndpointAlreadyRunning { .. } => ErrorKind::Conflict,
            BusError::Timeout { .. } => ErrorKind::Timeout,
            BusError::MessageExpired { .. } => ErrorKind::Gone,
            BusError::ConnectionFailed { .. } | BusError::CircuitBreakerOpen { .. } => {
                ErrorKind::Unavailable
            }
            BusError::Serialization { .. }
            | BusError::Deserialization { .. }
            | BusError::Transport { .. }
            | BusError::Cancelled
            | BusError::ConsumerFailed { .. }
            | BusError::DeliveryFailed { .. }
            | BusError::RetryExhausted { .. }
            | BusError::Failure { .. } => ErrorKind::Failure,
            BusError::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &str {
        match self {
            BusError::InvalidId { .. } => "courier.invalid_id",
            BusError::InvalidAddress { .. } => "courier.invalid_address",
            BusError::UnknownMessageType { .. } => "courier.unknown_message_type",
            BusError::Serialization { .. } => "courier.serialization_failed",
            BusError::Deserialization { .. } => "courier.deserialization_failed",
            BusError::Transport { .. } => "courier.transport_error",
            BusError::ConnectionFailed { .. } => "courier.connection_failed",
            BusError::Timeout { .. } => "courier.timeout",
            BusError::Cancelled => "courier.cancelled",
            BusError::CircuitBreakerOpen { .. } => "courier.circuit_breaker_open",
            BusError::ConsumerFailed { .. } => "courier.consumer_failed",
            BusError::SagaNotFound { .. } => "courier.saga_not_found",
            BusError::SagaConcurrencyConflict { .. } => "courier.saga_concurrency_conflict",
            BusError::SagaEventUnmatched { .. } => "courier.saga_event_unmatched",
            BusError::MissingCorrelation { .. } => "courier.missing_correlation",
            BusError::InvalidStateMachine { .. } => "courier.invalid_state_machine",
            BusError::DeliveryFailed { .. } => "courier.delivery_failed",
            BusError::RetryExhausted { .. } => "courier.retry_exhausted",
            BusError::MessageExpired { .. } => "courier.message_expired",
            BusError::EndpointAlreadyRunning { .. } => "courier.endpoint_already_running",
            BusError::Failure { code, .. } => code.as_str(),
            BusError::Unexpected { .. } => "courier.unexpected",
        }
    }

    /// Structured details for fault reports and logs.
    pub fn metadata(&self) -> BTreeMap<&'static str, String> {
        let mut metadata = BTreeMap::new();
        match self {
            BusError::InvalidId { value, .. } | BusError::InvalidAddress { value, .. } => {
                metadata.insert("value", value.clone());
            }
            BusError::ConnectionFailed { address, .. } | BusError::DeliveryFailed { address, .. } => {
                metadata.insert("address", address.clone());
            }
            BusError::Timeout { after } => {
                metadata.insert("after_ms", after.as_millis().to_string());
            }
            BusError::CircuitBreakerOpen { retry_after } => {
                metadata.insert("retry_after_ms", retry_after.as_millis().to_string());
            }
            BusError::ConsumerFailed { consumer, .. } => {
                metadata.insert("consumer", consumer.clone());
            }
            BusError::SagaNotFound { correlation_id } => {
                metadata.insert("correlation_id", correlation_id.to_string());
            }
            BusError::SagaConcurrencyConflict {
                correlation_id,
                expected,
                actual,
            } => {
                metadata.insert("correlation_id", correlation_id.to_string());
                metadata.insert("expected_version", expected.to_string());
                metadata.insert("actual_version", actual.to_string());
            }
            BusError::SagaEventUnmatched {
                correlation_id,
                state,
                message_type,
            } => {
                metadata.insert("correlation_id", correlation_id.to_string());
                metadata.insert("state", state.clone());
                metadata.insert("message_type", message_type.clone());
            }
            BusError::MissingCorrelation { message_type }
            | BusError::Deserialization { message_type, .. } => {
                metadata.insert("message_type", message_type.clone());
            }
            BusError::RetryExhausted { attempts, .. } => {
                metadata.insert("attempts", attempts.to_string());
            }
            BusError::MessageExpired { message_id, .. } => {
                metadata.insert("message_id", message_id.to_string());
            }
            _ => {}
        }
        metadata
    }

    /// Whether a retry policy may attempt the operation again.
    ///
    /// Configuration problems, caller cancellation and expired or unmatched
    /// messages fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::InvalidId { .. }
            | BusError::InvalidAddress { .. }
            | BusError::InvalidStateMachine { .. }
            | BusError::MissingCorrelation { .. }
            | BusError::UnknownMessageType { .. }
            | BusError::Deserialization { .. }
            | BusError::Cancelled
            | BusError::SagaEventUnmatched { .. }
            | BusError::MessageExpired { .. }
            | BusError::EndpointAlreadyRunning { .. } => false,
            BusError::ConsumerFailed { errors, .. } | BusError::RetryExhausted { errors, .. } => {
                errors.iter().all(BusError::is_retryable)
            }
            _ => true,
        }
    }

    /// The innermost errors, with consumer and retry wrappers removed.
    pub fn root_causes(&self) -> Vec<&BusError> {
        match self {
            BusError::ConsumerFailed { errors, .. } | BusError::RetryExhausted { errors, .. }
                if !errors.is_empty() =>
            {
                errors.iter().flat_map(BusError::root_causes).collect()
            }
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        let invalid = BusError::InvalidId {
            value: "x".into(),
            reason: "bad".into(),
        };
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert_eq!(
            BusError::CircuitBreakerOpen {
                retry_after: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            BusError::Timeout {
                after: Duration::from_millis(5)
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_anyhow_conversion_keeps_bus_errors() {
        let original = BusError::Cancelled;
        let converted = BusError::from_anyhow(anyhow::Error::new(original.clone()));
        assert_eq!(converted, original);

        let converted = BusError::from_anyhow(anyhow::anyhow!("disk on fire"));
        assert_eq!(converted.kind(), ErrorKind::Failure);
        assert_eq!(converted.code(), "consumer.exception");
        assert_eq!(converted.to_string(), "disk on fire");
    }

    #[test]
    fn test_wrapped_errors_inherit_retryability() {
        let wrapped = BusError::ConsumerFailed {
            consumer: "orders".into(),
            errors: vec![BusError::MissingCorrelation {
                message_type: "a".into(),
            }],
        };
        assert!(!wrapped.is_retryable());

        let wrapped = BusError::ConsumerFailed {
            consumer: "orders".into(),
            errors: vec![BusError::transport("reset")],
        };
        assert!(wrapped.is_retryable());
        assert_eq!(wrapped.root_causes(), vec![&BusError::transport("reset")]);
    }

    #[test]
    fn test_retry_exhausted_message_lists_history() {
        let error = BusError::RetryExhausted {
            attempts: 2,
            errors: vec![BusError::transport("one"), BusError::transport("two")],
        };
        assert_eq!(
            error.to_string(),
            "gave up after 2 attempt(s): transport error: one; transport error: two"
        );
        assert_eq!(error.metadata().get("attempts").map(String::as_str), Some("2"));
    }
}
