//! Typed messages and message-type identifiers.

use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stable identifier of a message contract, e.g. `urn:message:orders:OrderPlaced`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(Cow<'static, str>);

impl MessageType {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for MessageType {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered message-type list carried by an envelope, most specific first.
pub type MessageTypes = SmallVec<[MessageType; 2]>;

/// A message that can travel on the bus.
///
/// Implement it with [`impl_message!`](crate::impl_message) for the common
/// case. `SUPERTYPES` lists additional contracts the message satisfies, so a
/// consumer subscribed to a supertype also receives it.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Primary message type.
    const MESSAGE_TYPE: &'static str;

    /// Additional contracts, in decreasing specificity.
    const SUPERTYPES: &'static [&'static str] = &[];

    fn message_type() -> MessageType {
        MessageType::from_static(Self::MESSAGE_TYPE)
    }

    /// Primary type followed by supertypes.
    fn message_types() -> MessageTypes {
        std::iter::once(Self::MESSAGE_TYPE)
            .chain(Self::SUPERTYPES.iter().copied())
            .map(MessageType::from_static)
            .collect()
    }
}
