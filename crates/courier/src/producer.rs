//! Outbound side of the bus.
//!
//! [`Producer`] turns typed messages into envelopes and hands them to the
//! transport. Send transports are created once per destination and cached;
//! the publish transport is created once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::envelope::{HostInfo, MessageEnvelope};
use crate::error::BusResult;
use crate::headers;
use crate::id::{CorrelationId, MessageId};
use crate::message::Message;
use crate::serialization::Serializer;
use crate::transport::{PublishTransport, SendTransport, Transport};

struct Inner {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    host: HostInfo,
    send_transports: DashMap<EndpointAddress, Arc<OnceCell<Arc<dyn SendTransport>>>>,
    publish_transport: OnceCell<Arc<dyn PublishTransport>>,
    scheduled: Mutex<CancellationToken>,
}

/// Handle to a message scheduled for later publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub message_id: MessageId,
    pub scheduled_time: DateTime<Utc>,
}

/// Cheaply cloneable outbound handle shared by the bus and its consumers.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    pub fn new(transport: Arc<dyn Transport>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                serializer,
                host: HostInfo::current(),
                send_transports: DashMap::new(),
                publish_transport: OnceCell::new(),
                scheduled: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.inner.serializer.as_ref()
    }

    pub fn host(&self) -> &HostInfo {
        &self.inner.host
    }

    /// Envelope starting a new causal chain.
    ///
    /// Stamps host information and a fresh trace id.
    pub fn envelope<M: Message>(
        &self,
        message: &M,
        correlation_id: Option<CorrelationId>,
    ) -> BusResult<MessageEnvelope> {
        let envelope = MessageEnvelope::from_message(message, self.serializer(), correlation_id)?
            .with_host(self.inner.host.clone())
            .with_header(headers::TRACE_ID, Uuid::new_v4().simple().to_string())
            .with_header(headers::SPAN_ID, Uuid::new_v4().simple().to_string());
        Ok(envelope)
    }

    /// Cached send transport for `address`, created on first use.
    pub async fn send_transport(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>> {
        let cell = self
            .inner
            .send_transports
            .entry(address.clone())
            .or_default()
            .clone();
        let transport = cell
            .get_or_try_init(|| async {
                debug!(destination = %address, "Creating send transport");
                self.inner.transport.send_transport(address).await
            })
            .await?;
        Ok(transport.clone())
    }

    pub async fn publish_transport(&self) -> BusResult<Arc<dyn PublishTransport>> {
        let transport = self
            .inner
            .publish_transport
            .get_or_try_init(|| self.inner.transport.publish_transport())
            .await?;
        Ok(transport.clone())
    }

    pub async fn send_envelope(
        &self,
        address: &EndpointAddress,
        envelope: MessageEnvelope,
        cancellation: &CancellationToken,
    ) -> BusResult<()> {
        self.send_transport(address)
            .await?
            .send(self.stamp(envelope), cancellation)
            .await
    }

    pub async fn publish_envelope(
        &self,
        envelope: MessageEnvelope,
        cancellation: &CancellationToken,
    ) -> BusResult<()> {
        self.publish_transport()
            .await?
            .publish(self.stamp(envelope), cancellation)
            .await
    }

    /// Publish `envelope` after `delay`.
    ///
    /// Pending publications are dropped by [`cancel_scheduled`](Self::cancel_scheduled).
    pub fn schedule_publish(&self, envelope: MessageEnvelope, delay: Duration) -> ScheduledMessage {
        let scheduled_time = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let envelope = envelope.with_header(headers::SCHEDULED_TIME, scheduled_time.to_rfc3339());
        let handle = ScheduledMessage {
            message_id: envelope.message_id(),
            scheduled_time,
        };

        let cancellation = self.scheduled_token();
        let producer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => {
                    debug!(message_id = %handle.message_id, "Scheduled publish cancelled");
                    return;
                }
            }
            if let Err(e) = producer.publish_envelope(envelope, &cancellation).await {
                error!(message_id = %handle.message_id, error = %e, "Scheduled publish failed");
            }
        });
        handle
    }

    /// Drop every scheduled publication that has not fired yet.
    pub fn cancel_scheduled(&self) {
        let mut token = self
            .inner
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    fn scheduled_token(&self) -> CancellationToken {
        self.inner
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stamp(&self, envelope: MessageEnvelope) -> MessageEnvelope {
        if envelope.host().is_some() {
            envelope
        } else {
            envelope.with_host(self.inner.host.clone())
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("scheme", &self.inner.transport.scheme())
            .field("send_transports", &self.inner.send_transports.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;
    use crate::transport::in_memory::InMemoryTransport;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    crate::impl_message!(Ping, "test:Ping");

    fn producer() -> (Producer, InMemoryTransport) {
        let transport = InMemoryTransport::new();
        let producer = Producer::new(Arc::new(transport.clone()), Arc::new(JsonSerializer));
        (producer, transport)
    }

    #[tokio::test]
    async fn test_send_transport_is_cached() {
        let (producer, transport) = producer();
        let address = transport.address("orders").unwrap();
        let a = producer.send_transport(&address).await.unwrap();
        let b = producer.send_transport(&address).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let p1 = producer.publish_transport().await.unwrap();
        let p2 = producer.publish_transport().await.unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
    }

    #[tokio::test]
    async fn test_root_envelope_is_stamped() {
        let (producer, _) = producer();
        let envelope = producer.envelope(&Ping { n: 1 }, None).unwrap();
        assert!(envelope.host().is_some());
        assert!(envelope.headers().trace_id().is_some());
        assert_eq!(envelope.message_types(), &[Ping::message_type()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_publish_fires_after_delay() {
        let (producer, transport) = producer();
        let queue = transport.broker().queue("pings");
        transport.broker().bind(&Ping::message_type(), queue.clone());

        let envelope = producer.envelope(&Ping { n: 2 }, None).unwrap();
        let scheduled = producer.schedule_publish(envelope, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(queue.depth(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let delivered = queue.dequeue().await.unwrap();
        assert_eq!(delivered.message_id(), scheduled.message_id);
        assert!(delivered.headers().contains(headers::SCHEDULED_TIME));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_scheduled_drops_pending() {
        let (producer, transport) = producer();
        let queue = transport.broker().queue("pings");
        transport.broker().bind(&Ping::message_type(), queue.clone());

        producer.schedule_publish(producer.envelope(&Ping { n: 3 }, None).unwrap(), Duration::from_secs(5));
        producer.cancel_scheduled();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.depth(), 0);
    }
}
