//! Message identity.
//!
//! All identifiers are 128-bit UUIDs wrapped in distinct newtypes so a
//! message id can never be passed where a correlation id is expected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh, globally unique id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = BusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| BusError::InvalidId {
                        value: s.to_string(),
                        reason: e.to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Unique per envelope instance.
    MessageId
);

define_id!(
    /// Groups every message of one business transaction or saga instance.
    CorrelationId
);

define_id!(
    /// Groups the messages of one conversation across several transactions.
    ConversationId
);

impl From<MessageId> for CorrelationId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_parse_and_display() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let simple = id.as_uuid().simple().to_string();
        assert_eq!(simple.parse::<CorrelationId>().unwrap(), id);
    }

    #[test]
    fn test_invalid_string_is_validation_error() {
        let err = "not-a-uuid".parse::<MessageId>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(matches!(err, BusError::InvalidId { ref value, .. } if value == "not-a-uuid"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
