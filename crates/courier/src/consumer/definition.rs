use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::EndpointSettings;
use crate::retry::RetryPolicy;

/// Identity and settings a consumer brings to its endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDefinition {
    name: String,
    endpoint_name: String,
    retry: Option<RetryPolicy>,
    concurrency_limit: Option<usize>,
    prefetch: Option<usize>,
    use_error_queue: Option<bool>,
    timeout: Option<Duration>,
    circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ConsumerDefinition {
    /// Definition named after `T`: `OrderPlacedConsumer` listens on `order-placed`.
    pub fn for_type<T: ?Sized>() -> Self {
        let name = short_type_name(std::any::type_name::<T>());
        Self::new(name)
    }

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let endpoint_name = endpoint_name_for(&name);
        Self {
            name,
            endpoint_name,
            retry: None,
            concurrency_limit: None,
            prefetch: None,
            use_error_queue: None,
            timeout: None,
            circuit_breaker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Messages this consumer may process at once.
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.concurrency_limit
    }

    pub fn with_endpoint_name(mut self, endpoint_name: impl Into<String>) -> Self {
        self.endpoint_name = endpoint_name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit.max(1));
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_error_queue(mut self, enabled: bool) -> Self {
        self.use_error_queue = Some(enabled);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// The endpoint settings layer contributed by this definition.
    pub fn endpoint_settings(&self) -> EndpointSettings {
        EndpointSettings {
            concurrency: self.concurrency_limit,
            prefetch: self.prefetch,
            queue_capacity: None,
            use_error_queue: self.use_error_queue,
            timeout: self.timeout,
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
        }
    }
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Kebab-case endpoint name for a consumer type name, `Consumer` suffix removed.
pub fn endpoint_name_for(type_name: &str) -> String {
    let trimmed = type_name.strip_suffix("Consumer").unwrap_or(type_name);
    let trimmed = if trimmed.is_empty() { type_name } else { trimmed };
    kebab_case(trimmed)
}

/// `OrderPlaced` → `order-placed`, `HTTPFetch` → `http-fetch`, `order_state` → `order-state`.
pub fn kebab_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !out.ends_with('-') {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out.trim_end_matches('-').to_string()
}
