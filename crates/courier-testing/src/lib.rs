//! Testing utilities for Courier.
//!
//! - [`RecordingConsumer`] keeps every message it receives and can be told
//!   to fail, so tests can await deliveries instead of sleeping.
//! - [`ConcurrencyProbe`] measures how many handlers overlap.
//! - [`wait_until`] polls a condition with a deadline.
//!
//! ```ignore
//! let orders = RecordingConsumer::<OrderPlaced>::new("OrderAudit");
//! let bus = BusBuilder::new()
//!     .add_consumer::<OrderPlaced, _>(orders.clone())
//!     .build()?;
//! bus.start().await?;
//! bus.publish(&OrderPlaced { .. }).await?;
//! let received = orders.wait_for(1, Duration::from_secs(1)).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use courier_core::{ConsumeContext, Consumer, ConsumerDefinition, Message, MessageEnvelope};
use tokio::sync::Notify;

/// A message as a [`RecordingConsumer`] saw it.
#[derive(Debug, Clone)]
pub struct Received<M> {
    pub message: M,
    pub envelope: MessageEnvelope,
    pub retry_attempt: u32,
}

struct Recording<M> {
    received: Mutex<Vec<Received<M>>>,
    notify: Notify,
    failures_left: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

/// Consumer that records deliveries.
///
/// Clones share one recording, so a test can keep a handle while the bus
/// owns the registered copy.
pub struct RecordingConsumer<M> {
    definition: ConsumerDefinition,
    recording: Arc<Recording<M>>,
    probe: Option<ConcurrencyProbe>,
}

impl<M> Clone for RecordingConsumer<M> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            recording: self.recording.clone(),
            probe: self.probe.clone(),
        }
    }
}

impl<M: Message + Clone> RecordingConsumer<M> {
    /// Records on the endpoint derived from `name`.
    pub fn new(name: &str) -> Self {
        Self::with_definition(ConsumerDefinition::new(name))
    }

    pub fn with_definition(definition: ConsumerDefinition) -> Self {
        Self {
            definition,
            recording: Arc::new(Recording {
                received: Mutex::new(Vec::new()),
                notify: Notify::new(),
                failures_left: AtomicU32::new(0),
                delay: Mutex::new(None),
            }),
            probe: None,
        }
    }

    /// Fail the next `count` deliveries after recording them.
    pub fn failing(self, count: u32) -> Self {
        self.recording.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Hold each delivery for `delay` before returning.
    pub fn slow(self, delay: Duration) -> Self {
        *self
            .recording
            .delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    /// Track overlapping deliveries in `probe`.
    pub fn probed(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn received(&self) -> Vec<Received<M>> {
        self.lock().clone()
    }

    pub fn messages(&self) -> Vec<M> {
        self.lock().iter().map(|r| r.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `count` deliveries were recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<Received<M>>> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.recording.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        if waited.is_err() {
            bail!(
                "{} received {} of {count} message(s) within {timeout:?}",
                self.definition.name(),
                self.len()
            );
        }
        Ok(self.received())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Received<M>>> {
        self.recording
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<M: Message + Clone> Consumer<M> for RecordingConsumer<M> {
    async fn consume(&self, ctx: &ConsumeContext<M>) -> Result<()> {
        let _guard = self.probe.as_ref().map(ConcurrencyProbe::enter);
        let delay = *self
            .recording
            .delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.lock().push(Received {
            message: ctx.message().clone(),
            envelope: ctx.envelope().clone(),
            retry_attempt: ctx.retry_attempt(),
        });
        self.recording.notify.notify_waiters();

        let fail = self
            .recording
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            bail!("{} told to fail", self.definition.name());
        }
        Ok(())
    }

    fn definition(&self) -> ConsumerDefinition {
        self.definition.clone()
    }
}

/// Counts concurrently running sections and remembers the peak.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    inner: Arc<ProbeCounters>,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a section as running until the guard drops.
    pub fn enter(&self) -> ProbeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        self.inner.total.fetch_add(1, Ordering::SeqCst);
        ProbeGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    /// Sections entered so far.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    inner: Arc<ProbeCounters>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
