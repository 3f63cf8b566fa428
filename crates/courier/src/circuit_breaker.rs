//! Circuit breaker.
//!
//! ```text
//!                 success
//!            ┌──────────────┐
//!            ▼              │
//!      ┌──────────┐   threshold    ┌──────────┐  reset interval  ┌───────────┐
//!      │  CLOSED  │ ─────────────► │   OPEN   │ ───────────────► │ HALF-OPEN │
//!      │ (normal) │    failures    │ (reject) │                  │ (1 trial) │
//!      └──────────┘                └──────────┘ ◄─────────────── └───────────┘
//!            ▲                                    trial failed         │
//!            └─────────────────────────────────────────────────────────┘
//!                                  trial succeeded
//! ```
//!
//! While open, calls fail with [`BusError::CircuitBreakerOpen`] without
//! running the operation. Once the reset interval has elapsed exactly one
//! trial call is admitted; its outcome closes or re-opens the circuit.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{BusError, BusResult};
use crate::pipeline::{Filter, Next, PipeContext};

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial call
    pub reset_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_interval: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Calls are rejected immediately
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Circuit breaker guarding one operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, as seen by the next caller.
    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Consecutive failures counted while closed.
    pub fn consecutive_failures(&self) -> u32 {
        match *self.lock() {
            Phase::Closed { failures } => failures,
            _ => self.config.failure_threshold,
        }
    }

    /// Ask to run one call.
    ///
    /// The returned permit must be completed with the call's outcome;
    /// dropping it unfinished counts as a failure.
    pub fn try_acquire(&self) -> BusResult<CircuitPermit<'_>> {
        let mut phase = self.lock();
        let now = Instant::now();
        match *phase {
            Phase::Closed { .. } => Ok(CircuitPermit::new(self, false)),
            Phase::Open { until } if now >= until => {
                info!(breaker = %self.name, "Circuit breaker half-open, admitting trial call");
                *phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(CircuitPermit::new(self, true))
            }
            Phase::Open { until } => Err(BusError::CircuitBreakerOpen {
                retry_after: until - now,
            }),
            Phase::HalfOpen {
                trial_in_flight: true,
            } => Err(BusError::CircuitBreakerOpen {
                retry_after: Duration::ZERO,
            }),
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                *phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(CircuitPermit::new(self, true))
            }
        }
    }

    /// Run `operation` through the breaker.
    pub async fn call<T, F, Fut>(&self, operation: F) -> BusResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BusResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.complete(result.is_ok());
        result
    }

    fn record(&self, success: bool, trial: bool) {
        let mut phase = self.lock();
        match *phase {
            Phase::Closed { failures } => {
                if success {
                    *phase = Phase::Closed { failures: 0 };
                    return;
                }
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures,
                        reset_ms = self.config.reset_interval.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                    *phase = Phase::Open {
                        until: Instant::now() + self.config.reset_interval,
                    };
                } else {
                    *phase = Phase::Closed { failures };
                }
            }
            Phase::HalfOpen { .. } if trial => {
                if success {
                    info!(breaker = %self.name, "Circuit breaker closed after successful trial");
                    *phase = Phase::Closed { failures: 0 };
                } else {
                    warn!(breaker = %self.name, "Circuit breaker trial failed, re-opening");
                    *phase = Phase::Open {
                        until: Instant::now() + self.config.reset_interval,
                    };
                }
            }
            // Late outcomes of calls admitted before the circuit opened
            Phase::HalfOpen { .. } | Phase::Open { .. } => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to run one call through a [`CircuitBreaker`].
#[must_use = "complete the permit with the call outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    completed: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            completed: false,
        }
    }

    /// Whether this is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn complete(mut self, success: bool) {
        self.completed = true;
        self.breaker.record(success, self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.record(false, self.trial);
        }
    }
}

/// Applies a shared [`CircuitBreaker`] to the rest of a pipeline.
#[derive(Debug, Clone)]
pub struct CircuitBreakerFilter {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerFilter {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for CircuitBreakerFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> BusResult<()> {
        let permit = self.breaker.try_acquire()?;
        let result = next.run(ctx).await;
        permit.complete(result.is_ok());
        result
    }

    fn name(&self) -> &str {
        "circuit-breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_interval: reset,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> BusResult<()> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BusError::transport("down"))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> BusResult<()> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let breaker = breaker(3, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert!(fail(&breaker, &calls).await.is_err());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker, &calls).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = succeed(&breaker, &calls).await.unwrap_err();
        assert!(matches!(err, BusError::CircuitBreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not run the call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker(2, Duration::from_secs(10));
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await.unwrap();
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_exactly_one_trial_after_reset_interval() {
        let breaker = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(
            breaker.try_acquire(),
            Err(BusError::CircuitBreakerOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(matches!(
            breaker.try_acquire(),
            Err(BusError::CircuitBreakerOpen { .. })
        ));

        trial.complete(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker, &calls).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(fail(&breaker, &calls).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = breaker(1, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
