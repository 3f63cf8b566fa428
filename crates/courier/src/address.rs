//! Endpoint addresses (`scheme://name`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BusError;

const SEPARATOR: &str = "://";

/// Address of a queue or endpoint on some transport.
///
/// Parsing normalizes the text (trimmed, lowercase, no trailing `/`), and two
/// addresses are equal when their normalized forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    scheme: String,
    name: String,
}

impl EndpointAddress {
    /// Build an address from its parts.
    pub fn new(scheme: &str, name: &str) -> Result<Self, BusError> {
        let scheme = scheme.trim().to_ascii_lowercase();
        let name = name.trim().trim_end_matches('/').to_ascii_lowercase();
        let raw = format!("{scheme}{SEPARATOR}{name}");

        if scheme.is_empty() {
            return Err(invalid(&raw, "scheme is empty"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid(&raw, "scheme contains invalid characters"));
        }
        if name.is_empty() {
            return Err(invalid(&raw, "name is empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid(&raw, "name contains whitespace"));
        }

        Ok(Self { scheme, name })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sibling queue receiving messages that failed processing.
    pub fn error_queue(&self) -> Self {
        self.with_suffix("_error")
    }

    /// Sibling queue receiving messages nobody consumes.
    pub fn skipped_queue(&self) -> Self {
        self.with_suffix("_skipped")
    }

    fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            scheme: self.scheme.clone(),
            name: format!("{}{suffix}", self.name),
        }
    }
}

fn invalid(value: &str, reason: &str) -> BusError {
    BusError::InvalidAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.scheme, self.name)
    }
}

impl FromStr for EndpointAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(SEPARATOR) {
            Some((scheme, name)) => Self::new(scheme, name).map_err(|e| match e {
                BusError::InvalidAddress { reason, .. } => invalid(s, &reason),
                other => other,
            }),
            None => Err(invalid(s, "expected scheme://name")),
        }
    }
}

impl Serialize for EndpointAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let a: EndpointAddress = " InMemory://Orders-Queue/ ".parse().unwrap();
        let b: EndpointAddress = "inmemory://orders-queue".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "inmemory://orders-queue");
        assert_eq!(a.scheme(), "inmemory");
        assert_eq!(a.name(), "orders-queue");
    }

    #[test]
    fn test_invalid_addresses() {
        for raw in ["orders", "://orders", "inmemory://", "in memory://x", "inmemory://a b"] {
            let err = raw.parse::<EndpointAddress>().unwrap_err();
            assert!(
                matches!(err, BusError::InvalidAddress { .. }),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_sibling_queues() {
        let address = EndpointAddress::new("inmemory", "orders").unwrap();
        assert_eq!(address.error_queue().to_string(), "inmemory://orders_error");
        assert_eq!(address.skipped_queue().name(), "orders_skipped");
    }

    #[test]
    fn test_serde_uses_string_form() {
        let address = EndpointAddress::new("inmemory", "orders").unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"inmemory://orders\"");
        let back: EndpointAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
