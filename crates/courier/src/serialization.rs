//! Message serialization.
//!
//! [`Serializer`] is object safe so the bus can hold one behind an `Arc`:
//! encoding goes through `erased-serde`, decoding produces a neutral
//! `serde_json::Value` that typed helpers finish into the target type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BusError;
use crate::message::{Message, MessageType};

/// Wire codec used by the bus.
pub trait Serializer: Send + Sync {
    /// MIME type stamped on envelopes produced by this serializer.
    fn content_type(&self) -> &str;

    fn encode(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>, BusError>;

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError>;
}

/// JSON codec (`application/json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(value).map_err(|e| BusError::Serialization {
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Deserialization {
            message_type: "<unknown>".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Serialize a typed value.
pub fn serialize<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>, BusError> {
    serializer.encode(value)
}

/// Deserialize bytes into a typed value.
///
/// `message_type` only labels the error.
pub fn deserialize<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
    message_type: &str,
) -> Result<T, BusError> {
    let relabel = |reason: String| BusError::Deserialization {
        message_type: message_type.to_string(),
        reason,
    };
    let value = serializer.decode(bytes).map_err(|e| match e {
        BusError::Deserialization { reason, .. } => relabel(reason),
        other => other,
    })?;
    serde_json::from_value(value).map_err(|e| relabel(e.to_string()))
}

type Decoder = Arc<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send>, BusError> + Send + Sync>;

/// Runtime-typed decoding keyed by message type.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    decoders: HashMap<MessageType, Decoder>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under its primary message type.
    pub fn register<M: Message>(&mut self) {
        let decoder: Decoder = Arc::new(|value| {
            serde_json::from_value::<M>(value)
                .map(|message| Box::new(message) as Box<dyn Any + Send>)
                .map_err(|e| BusError::Deserialization {
                    message_type: M::MESSAGE_TYPE.to_string(),
                    reason: e.to_string(),
                })
        });
        self.decoders.insert(M::message_type(), decoder);
    }

    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.decoders.contains_key(message_type)
    }

    pub fn message_types(&self) -> impl Iterator<Item = &MessageType> {
        self.decoders.keys()
    }

    /// Decode bytes into the Rust type registered for `message_type`.
    pub fn deserialize(
        &self,
        serializer: &dyn Serializer,
        message_type: &MessageType,
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send>, BusError> {
        let decoder = self
            .decoders
            .get(message_type)
            .ok_or_else(|| BusError::UnknownMessageType {
                message_types: vec![message_type.to_string()],
            })?;
        let value = serializer.decode(bytes)?;
        decoder(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u32,
        amount: u64,
    }

    crate::impl_message!(OrderPlaced, "orders:OrderPlaced");

    #[test]
    fn test_typed_helpers() {
        let bytes = serialize(&JsonSerializer, &OrderPlaced { order_id: 1, amount: 100 }).unwrap();
        let back: OrderPlaced = deserialize(&JsonSerializer, &bytes, "orders:OrderPlaced").unwrap();
        assert_eq!(back.amount, 100);
    }

    #[test]
    fn test_bad_bytes_report_message_type() {
        let err = deserialize::<OrderPlaced>(&JsonSerializer, b"{not json", "orders:OrderPlaced")
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Deserialization { ref message_type, .. } if message_type == "orders:OrderPlaced"
        ));
    }

    #[test]
    fn test_registry_decodes_runtime_type() {
        let mut registry = MessageTypeRegistry::new();
        registry.register::<OrderPlaced>();

        let bytes = serialize(&JsonSerializer, &OrderPlaced { order_id: 9, amount: 5 }).unwrap();
        let decoded = registry
            .deserialize(&JsonSerializer, &OrderPlaced::message_type(), &bytes)
            .unwrap();
        let order = decoded.downcast::<OrderPlaced>().unwrap();
        assert_eq!(order.order_id, 9);
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = MessageTypeRegistry::new();
        let err = registry
            .deserialize(&JsonSerializer, &MessageType::from("nope"), b"{}")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
