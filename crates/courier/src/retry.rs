//! Retry policies.
//!
//! A [`RetryPolicy`] is pure decision logic: how long to wait before attempt
//! `k` and whether another attempt is allowed. [`RetryPolicy::execute`] and
//! [`RetryFilter`] apply it to an async operation and to a pipeline.
//!
//! # Delays
//!
//! | Policy | delay(k) |
//! |--------|----------|
//! | `None` | never retries |
//! | `Immediate` | 0 |
//! | `Interval` | fixed |
//! | `Exponential` | `min(max_delay, min_delay * 2^k)` |

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{BusError, BusResult};
use crate::pipeline::{Filter, Next, PipeContext};

/// How often and how quickly a failed operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never retry
    #[default]
    None,
    /// Retry at once, up to `limit` times
    Immediate { limit: u32 },
    /// Retry after a fixed delay
    Interval { limit: u32, delay: Duration },
    /// Retry with a doubling delay bounded by `max_delay`
    Exponential {
        limit: u32,
        min_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    pub fn immediate(limit: u32) -> Self {
        RetryPolicy::Immediate { limit }
    }

    pub fn interval(limit: u32, delay: Duration) -> Self {
        RetryPolicy::Interval { limit, delay }
    }

    pub fn exponential(limit: u32, min_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy::Exponential {
            limit,
            min_delay,
            max_delay,
        }
    }

    /// Maximum number of retries after the first attempt.
    pub fn limit(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Immediate { limit }
            | RetryPolicy::Interval { limit, .. }
            | RetryPolicy::Exponential { limit, .. } => *limit,
        }
    }

    /// Delay before the retry following attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None | RetryPolicy::Immediate { .. } => Duration::ZERO,
            RetryPolicy::Interval { delay, .. } => *delay,
            RetryPolicy::Exponential {
                min_delay,
                max_delay,
                ..
            } => {
                let base = min_delay.as_nanos();
                let max = max_delay.as_nanos();
                // Shifting past the leading zeros would overflow u128
                let nanos = if base == 0 {
                    0
                } else if base.leading_zeros() >= attempt {
                    (base << attempt).min(max)
                } else {
                    max
                };
                let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
                Duration::new(secs, (nanos % 1_000_000_000) as u32)
            }
        }
    }

    /// Whether another attempt may follow the one described by `context`.
    pub fn should_retry(&self, context: &RetryContext) -> bool {
        context.attempt() < self.limit()
    }

    /// Run `operation` under this policy.
    ///
    /// Non-retryable errors are returned unchanged. When the policy gives up
    /// after at least one retry the result is [`BusError::RetryExhausted`]
    /// with every attempt's errors in order.
    pub async fn execute<T, F, Fut>(&self, cancellation: &CancellationToken, mut operation: F) -> BusResult<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = BusResult<T>>,
    {
        let mut context = RetryContext::new();
        loop {
            let error = match operation(context.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            context = match self.after_failure(context, error, cancellation).await {
                Ok(next) => next,
                Err(error) => return Err(error),
            };
        }
    }

    /// Decide what follows a failed attempt: the next context, or the final error.
    async fn after_failure(
        &self,
        context: RetryContext,
        error: BusError,
        cancellation: &CancellationToken,
    ) -> Result<RetryContext, BusError> {
        if !error.is_retryable() {
            return Err(error);
        }
        if !self.should_retry(&context) {
            return Err(self.give_up(context, error));
        }

        let delay = self.delay(context.attempt());
        debug!(
            attempt = context.attempt(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => return Err(BusError::Cancelled),
            }
        } else if cancellation.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        Ok(context.next_attempt(vec![error]))
    }

    fn give_up(&self, context: RetryContext, error: BusError) -> BusError {
        if self.limit() == 0 {
            return error;
        }
        let attempts = context.attempt() + 1;
        warn!(attempts, error = %error, "Retry limit reached");
        let mut errors = context.into_history();
        errors.push(error);
        BusError::RetryExhausted { attempts, errors }
    }
}

/// Progress of one logical operation across attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    attempt: u32,
    started_at: DateTime<Utc>,
    previous_errors: Vec<BusError>,
    last_errors: Vec<BusError>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started_at: Utc::now(),
            previous_errors: Vec::new(),
            last_errors: Vec::new(),
        }
    }

    /// 0-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn previous_errors(&self) -> &[BusError] {
        &self.previous_errors
    }

    pub fn last_errors(&self) -> &[BusError] {
        &self.last_errors
    }

    /// Context for the next attempt, after the current one failed with `errors`.
    pub fn next_attempt(&self, errors: Vec<BusError>) -> Self {
        let mut previous_errors = self.previous_errors.clone();
        previous_errors.extend(self.last_errors.iter().cloned());
        Self {
            attempt: self.attempt + 1,
            started_at: self.started_at,
            previous_errors,
            last_errors: errors,
        }
    }

    /// Every error recorded so far, oldest first.
    pub fn into_history(self) -> Vec<BusError> {
        let mut errors = self.previous_errors;
        errors.extend(self.last_errors);
        errors
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a [`RetryPolicy`] to the rest of a pipeline.
///
/// The current [`RetryContext`] is stored in the context payload while the
/// remainder runs, so downstream filters and consumers can read the attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryFilter {
    policy: RetryPolicy,
}

impl RetryFilter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for RetryFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> BusResult<()> {
        let cancellation = ctx.base().cancellation().clone();
        let mut retry = RetryContext::new();
        loop {
            ctx.base_mut().payload_mut().insert(retry.clone());
            let error = match next.run(ctx).await {
                Ok(()) => {
                    ctx.base_mut().payload_mut().remove::<RetryContext>();
                    return Ok(());
                }
                Err(error) => error,
            };
            retry = match self.policy.after_failure(retry, error, &cancellation).await {
                Ok(next_retry) => next_retry,
                Err(error) => {
                    ctx.base_mut().payload_mut().remove::<RetryContext>();
                    return Err(error);
                }
            };
        }
    }

    fn name(&self) -> &str {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ContextBase, Pipe, Terminal};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_delay_matches_formula() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let policy = RetryPolicy::exponential(8, min, max);
        for k in 0..8u32 {
            let expected = (min * 2u32.pow(k)).min(max);
            assert_eq!(policy.delay(k), expected, "attempt {k}");
        }
        assert_eq!(policy.delay(63), max);
    }

    #[test]
    fn test_exponential_delay_is_exact_past_u32_factors() {
        let policy = RetryPolicy::exponential(40, Duration::from_nanos(1), Duration::from_secs(3600));
        assert_eq!(policy.delay(35), Duration::from_nanos(1 << 35));
        assert_eq!(policy.delay(32), Duration::from_nanos(1 << 32));
        assert_eq!(policy.delay(42), Duration::from_secs(3600));
        assert_eq!(policy.delay(200), Duration::from_secs(3600));
        assert_eq!(
            RetryPolicy::exponential(3, Duration::ZERO, Duration::from_secs(1)).delay(500),
            Duration::ZERO
        );
    }

    #[test]
    fn test_should_retry_iff_attempt_below_limit() {
        let policy = RetryPolicy::interval(3, Duration::from_millis(10));
        let mut context = RetryContext::new();
        let mut allowed = Vec::new();
        for _ in 0..5 {
            allowed.push(policy.should_retry(&context));
            context = context.next_attempt(vec![BusError::transport("x")]);
        }
        assert_eq!(allowed, vec![true, true, true, false, false]);
        assert!(!RetryPolicy::None.should_retry(&RetryContext::new()));
    }

    #[test]
    fn test_immediate_and_interval_delays() {
        assert_eq!(RetryPolicy::immediate(5).delay(3), Duration::ZERO);
        assert_eq!(
            RetryPolicy::interval(5, Duration::from_millis(250)).delay(4),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_next_attempt_accumulates_history() {
        let first = RetryContext::new();
        let second = first.next_attempt(vec![BusError::transport("a")]);
        let third = second.next_attempt(vec![BusError::transport("b")]);

        assert_eq!(third.attempt(), 2);
        assert_eq!(third.started_at(), first.started_at());
        assert_eq!(third.previous_errors(), &[BusError::transport("a")]);
        assert_eq!(third.last_errors(), &[BusError::transport("b")]);
    }

    #[tokio::test]
    async fn test_execute_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .execute(&CancellationToken::new(), |context| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert_eq!(context.attempt(), n);
                    if n < 2 {
                        Err(BusError::transport("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_exhaustion_carries_every_error() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(2)
            .execute(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(BusError::transport(format!("attempt {n}"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            BusError::RetryExhausted { attempts, errors } => {
                assert_eq!(attempts, 3);
                assert_eq!(
                    errors,
                    vec![
                        BusError::transport("attempt 0"),
                        BusError::transport("attempt 1"),
                        BusError::transport("attempt 2"),
                    ]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(5)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(BusError::MissingCorrelation {
                        message_type: "a".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, BusError::MissingCorrelation { .. }));
    }

    #[tokio::test]
    async fn test_none_policy_returns_original_error() {
        let err = RetryPolicy::None
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(BusError::transport("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err, BusError::transport("down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let started = tokio::time::Instant::now();
        let _ = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(10))
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(BusError::transport("down"))
            })
            .await;
        // 100 + 200 + 400
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = RetryPolicy::interval(10, Duration::from_secs(60))
            .execute(&token, |_| async { Err::<(), _>(BusError::transport("down")) })
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Cancelled);
    }

    struct FailTimes {
        remaining: AtomicU32,
        seen_attempts: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Terminal<ContextBase> for Arc<FailTimes> {
        async fn call(&self, ctx: &mut ContextBase) -> BusResult<()> {
            let attempt = ctx.payload().get::<RetryContext>().map(RetryContext::attempt);
            self.seen_attempts.lock().unwrap().push(attempt.unwrap_or(u32::MAX));
            if self.remaining.load(Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(BusError::transport("boom"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_filter_exposes_attempt_in_payload() {
        let terminal = Arc::new(FailTimes {
            remaining: AtomicU32::new(2),
            seen_attempts: std::sync::Mutex::new(Vec::new()),
        });
        let pipe = Pipe::builder()
            .add_filter(RetryFilter::new(RetryPolicy::immediate(5)))
            .build();
        let mut ctx = ContextBase::new(CancellationToken::new());
        pipe.send(&mut ctx, &terminal).await.unwrap();

        assert_eq!(*terminal.seen_attempts.lock().unwrap(), vec![0, 1, 2]);
        assert!(!ctx.payload().contains::<RetryContext>());
    }
}
