//! Bus and endpoint configuration.
//!
//! Settings resolve in three layers, later layers winning:
//!
//! ```text
//! BusConfig (bus-wide defaults)
//!     └─► ConsumerDefinition settings
//!             └─► EndpointSettings overrides (receive_endpoint)
//! ```
//!
//! Every struct deserializes from partial JSON; missing fields fall back to
//! [`Default`].

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

pub const ENV_CONCURRENCY: &str = "COURIER_CONCURRENCY";
pub const ENV_PREFETCH: &str = "COURIER_PREFETCH";
pub const ENV_QUEUE_CAPACITY: &str = "COURIER_QUEUE_CAPACITY";
pub const ENV_USE_ERROR_QUEUE: &str = "COURIER_USE_ERROR_QUEUE";
pub const ENV_TIMEOUT_MS: &str = "COURIER_TIMEOUT_MS";

/// Bus-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Workers per endpoint; `None` uses the host's available parallelism
    pub concurrency: Option<usize>,
    /// Upper bound on messages in flight per endpoint; `None` is unbounded
    pub prefetch: Option<usize>,
    /// Capacity of lazily created queues; `None` creates unbounded queues
    pub queue_capacity: Option<usize>,
    /// Move exhausted messages to `<queue>_error`
    pub use_error_queue: bool,
    /// Per-message consumer timeout
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            prefetch: None,
            queue_capacity: None,
            use_error_queue: true,
            timeout: None,
            retry: RetryPolicy::None,
            circuit_breaker: None,
        }
    }
}

impl BusConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(concurrency) = parse::<usize>(&lookup, ENV_CONCURRENCY) {
            self.concurrency = Some(concurrency);
        }
        if let Some(prefetch) = parse::<usize>(&lookup, ENV_PREFETCH) {
            self.prefetch = Some(prefetch);
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_QUEUE_CAPACITY) {
            self.queue_capacity = Some(capacity);
        }
        if let Some(use_error_queue) = parse::<bool>(&lookup, ENV_USE_ERROR_QUEUE) {
            self.use_error_queue = use_error_queue;
        }
        if let Some(timeout_ms) = parse::<u64>(&lookup, ENV_TIMEOUT_MS) {
            self.timeout = Some(Duration::from_millis(timeout_ms));
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_error_queue(mut self, enabled: bool) -> Self {
        self.use_error_queue = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid configuration override");
            None
        }
    }
}

/// Partial per-endpoint settings; `None` inherits from the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub concurrency: Option<usize>,
    pub prefetch: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub use_error_queue: Option<bool>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl EndpointSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn use_error_queue(mut self, enabled: bool) -> Self {
        self.use_error_queue = Some(enabled);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Layer `overrides` on top of `self`.
    pub fn merge(&self, overrides: &EndpointSettings) -> EndpointSettings {
        EndpointSettings {
            concurrency: overrides.concurrency.or(self.concurrency),
            prefetch: overrides.prefetch.or(self.prefetch),
            queue_capacity: overrides.queue_capacity.or(self.queue_capacity),
            use_error_queue: overrides.use_error_queue.or(self.use_error_queue),
            timeout: overrides.timeout.or(self.timeout),
            retry: overrides.retry.or(self.retry),
            circuit_breaker: overrides.circuit_breaker.or(self.circuit_breaker),
        }
    }

    /// Only the fields that size the endpoint's queue and worker pool.
    ///
    /// Retry, timeout, circuit breaker and error-queue usage belong to each
    /// registration and are dropped.
    pub fn endpoint_wide(&self) -> EndpointSettings {
        EndpointSettings {
            concurrency: self.concurrency,
            prefetch: self.prefetch,
            queue_capacity: self.queue_capacity,
            ..EndpointSettings::default()
        }
    }

    /// Fill every unset field from the bus defaults.
    pub fn resolve(&self, defaults: &BusConfig) -> EndpointConfig {
        let concurrency = self
            .concurrency
            .or(defaults.concurrency)
            .unwrap_or_else(host_parallelism)
            .max(1);
        let prefetch = self.prefetch.or(defaults.prefetch).filter(|p| *p > 0);
        EndpointConfig {
            concurrency,
            prefetch,
            queue_capacity: self.queue_capacity.or(defaults.queue_capacity),
            use_error_queue: self.use_error_queue.unwrap_or(defaults.use_error_queue),
            timeout: self.timeout.or(defaults.timeout),
            retry: self.retry.unwrap_or(defaults.retry),
            circuit_breaker: self.circuit_breaker.or(defaults.circuit_breaker),
        }
    }
}

/// Fully resolved endpoint configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub concurrency: usize,
    pub prefetch: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub use_error_queue: bool,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl EndpointConfig {
    /// Worker tasks to spawn: concurrency capped by prefetch.
    pub fn worker_count(&self) -> usize {
        match self.prefetch {
            Some(prefetch) => self.concurrency.min(prefetch),
            None => self.concurrency,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointSettings::default().resolve(&BusConfig::default())
    }
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
