//! Filter pipelines.
//!
//! A [`Pipe`] is an ordered list of [`Filter`]s in front of a [`Terminal`].
//! Each filter receives the mutable context and a [`Next`] handle for the
//! rest of the chain:
//!
//! ```text
//! ctx ─► Filter 1 ─► Filter 2 ─► ... ─► Terminal
//!          │            │
//!          │            └─ may call next several times (retry)
//!          └─ may skip next (short-circuit)
//! ```
//!
//! Contexts expose a shared [`ContextBase`] (cancellation, typed payload,
//! completion flag) through [`PipeContext`], so generic filters such as
//! [`TimeoutFilter`] work on every pipeline.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, Instrument};

use crate::cancel::CancellationToken;
use crate::error::{BusError, BusResult};

// ============================================================================
// Context
// ============================================================================

/// Typed key→value bag; the key is the value's type.
#[derive(Default)]
pub struct Payload {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("len", &self.values.len()).finish()
    }
}

/// State shared by every pipeline context.
#[derive(Debug)]
pub struct ContextBase {
    cancellation: CancellationToken,
    payload: Payload,
    completed: bool,
}

impl ContextBase {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            payload: Payload::new(),
            completed: false,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Replace the token for the rest of the chain, returning the old one.
    pub fn replace_cancellation(&mut self, token: CancellationToken) -> CancellationToken {
        std::mem::replace(&mut self.cancellation, token)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

/// A context that can flow through a [`Pipe`].
pub trait PipeContext: Send + 'static {
    fn base(&self) -> &ContextBase;
    fn base_mut(&mut self) -> &mut ContextBase;
}

impl PipeContext for ContextBase {
    fn base(&self) -> &ContextBase {
        self
    }

    fn base_mut(&mut self) -> &mut ContextBase {
        self
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Middleware around the rest of a pipeline.
#[async_trait]
pub trait Filter<C>: Send + Sync {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> BusResult<()>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// End of a pipeline.
#[async_trait]
pub trait Terminal<C>: Send + Sync {
    async fn call(&self, ctx: &mut C) -> BusResult<()>;
}

/// The remainder of a pipeline, handed to each filter.
///
/// `Next` is `Copy`, so a filter may run the remainder more than once.
pub struct Next<'a, C> {
    filters: &'a [Arc<dyn Filter<C>>],
    terminal: &'a dyn Terminal<C>,
}

impl<C> Clone for Next<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Next<'_, C> {}

impl<C: PipeContext> Next<'_, C> {
    pub async fn run(self, ctx: &mut C) -> BusResult<()> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                let next = Next {
                    filters: rest,
                    terminal: self.terminal,
                };
                filter.send(ctx, next).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

/// Composed filter chain.
pub struct Pipe<C> {
    filters: Vec<Arc<dyn Filter<C>>>,
}

impl<C> Clone for Pipe<C> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<C: PipeContext> Pipe<C> {
    /// Pipe without filters.
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn builder() -> PipeBuilder<C> {
        PipeBuilder::new()
    }

    /// Run the filters in order, then the terminal.
    pub async fn send(&self, ctx: &mut C, terminal: &dyn Terminal<C>) -> BusResult<()> {
        Next {
            filters: &self.filters,
            terminal,
        }
        .run(ctx)
        .await
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Builds a [`Pipe`] from filters in insertion order.
pub struct PipeBuilder<C> {
    filters: Vec<Arc<dyn Filter<C>>>,
}

impl<C: PipeContext> PipeBuilder<C> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn add_filter<F: Filter<C> + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn add_shared(mut self, filter: Arc<dyn Filter<C>>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Pipe<C> {
        Pipe {
            filters: self.filters,
        }
    }
}

impl<C: PipeContext> Default for PipeBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Fails the rest of the chain with [`BusError::Timeout`] after a duration.
///
/// The rest of the chain sees a child cancellation token that fires at the
/// deadline. A cancellation the caller did not request surfaces as a
/// timeout; a caller cancellation stays [`BusError::Cancelled`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutFilter {
    duration: Duration,
}

impl TimeoutFilter {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for TimeoutFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> BusResult<()> {
        let caller = ctx.base().cancellation().clone();
        let derived = caller.child();
        ctx.base_mut().replace_cancellation(derived.clone());

        let outcome = tokio::time::timeout(self.duration, next.run(ctx)).await;
        ctx.base_mut().replace_cancellation(caller.clone());

        match outcome {
            Err(_elapsed) => {
                derived.cancel();
                Err(BusError::Timeout {
                    after: self.duration,
                })
            }
            Ok(Err(BusError::Cancelled)) if !caller.is_cancelled() => Err(BusError::Timeout {
                after: self.duration,
            }),
            Ok(result) => result,
        }
    }

    fn name(&self) -> &str {
        "timeout"
    }
}

/// Runs the rest of the chain inside a debug span and logs its duration.
#[derive(Debug, Clone)]
pub struct LoggingFilter {
    label: String,
}

impl LoggingFilter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for LoggingFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> BusResult<()> {
        let span = tracing::debug_span!("pipe", label = %self.label);
        let started = Instant::now();
        let result = next.run(ctx).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis();
        match &result {
            Ok(()) => debug!(label = %self.label, elapsed_ms, "Pipeline completed"),
            Err(e) => debug!(label = %self.label, elapsed_ms, error = %e, "Pipeline failed"),
        }
        result
    }

    fn name(&self) -> &str {
        "logging"
    }
}
