//! Envelope headers and the header wire contract.
//!
//! Broker adapters map these keys onto their native header facilities. The
//! key names are stable and share the [`PREFIX`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix shared by every well-known header key.
pub const PREFIX: &str = "courier-";

pub const TRACE_ID: &str = "courier-trace-id";
pub const SPAN_ID: &str = "courier-span-id";
pub const PARENT_SPAN_ID: &str = "courier-parent-span-id";
pub const TENANT_ID: &str = "courier-tenant-id";
pub const INITIATOR_ID: &str = "courier-initiator-id";
pub const PRIORITY: &str = "courier-priority";
pub const TIME_TO_LIVE: &str = "courier-time-to-live";
pub const SCHEDULED_TIME: &str = "courier-scheduled-time";
pub const RETRY_ATTEMPT: &str = "courier-retry-attempt";
pub const MAX_RETRIES: &str = "courier-max-retries";
pub const FAULT_EXCEPTION_TYPE: &str = "courier-fault-exception-type";
pub const FAULT_REASON: &str = "courier-fault-reason";

/// Headers copied onto every outgoing envelope caused by an inbound one.
pub const PROPAGATED: [&str; 2] = [TRACE_ID, TENANT_ID];

/// Ordered string map of envelope headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a header value, ignoring values that fail to parse.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Read an RFC 3339 timestamp header.
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn set_time(&mut self, key: &str, time: DateTime<Utc>) {
        self.insert(key, time.to_rfc3339());
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.get(TRACE_ID)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.get(TENANT_ID)
    }

    pub fn retry_attempt(&self) -> Option<u32> {
        self.get_parsed(RETRY_ATTEMPT)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_keys_share_prefix() {
        for key in [
            TRACE_ID,
            SPAN_ID,
            PARENT_SPAN_ID,
            TENANT_ID,
            INITIATOR_ID,
            PRIORITY,
            TIME_TO_LIVE,
            SCHEDULED_TIME,
            RETRY_ATTEMPT,
            MAX_RETRIES,
            FAULT_EXCEPTION_TYPE,
            FAULT_REASON,
        ] {
            assert!(key.starts_with(PREFIX), "{key}");
        }
    }

    #[test]
    fn test_typed_accessors() {
        let mut headers = Headers::new();
        headers.insert(RETRY_ATTEMPT, "3");
        headers.insert(PRIORITY, "high");
        assert_eq!(headers.retry_attempt(), Some(3));
        assert_eq!(headers.get_parsed::<u8>(PRIORITY), None);

        let now = Utc::now();
        headers.set_time(SCHEDULED_TIME, now);
        assert_eq!(headers.get_time(SCHEDULED_TIME), Some(now));
    }
}
