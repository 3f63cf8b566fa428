use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::broker::InMemoryBroker;
use super::queue::InMemoryQueue;
use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::error::{BusError, BusResult};
use crate::transport::{EnvelopeDispatcher, ReceiveEndpoint};

struct Running {
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Receive endpoint backed by an [`InMemoryQueue`].
///
/// ```text
///                 ┌─► worker 1 ─┐
/// queue ──────────┼─► worker 2 ─┼─► dispatcher
///  (shared)       └─► worker N ─┘
/// ```
///
/// Workers only stop between messages; [`stop`](ReceiveEndpoint::stop)
/// returns once every in-flight message has finished.
pub struct InMemoryReceiveEndpoint {
    address: EndpointAddress,
    queue: Arc<InMemoryQueue>,
    broker: Arc<InMemoryBroker>,
    dispatcher: Arc<dyn EnvelopeDispatcher>,
    worker_count: usize,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
}

impl InMemoryReceiveEndpoint {
    pub fn new(
        address: EndpointAddress,
        queue: Arc<InMemoryQueue>,
        broker: Arc<InMemoryBroker>,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
        worker_count: usize,
    ) -> Self {
        Self {
            address,
            queue,
            broker,
            dispatcher,
            worker_count: worker_count.max(1),
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }

    fn spawn_worker(&self, index: usize, stop: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let dispatcher = self.dispatcher.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            // In-flight messages are not cancelled by a graceful stop
            let processing = CancellationToken::new();
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    envelope = queue.dequeue() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let message_id = envelope.message_id();
                debug!(endpoint = %address, worker = index, %message_id, "Dequeued message");
                if let Err(e) = dispatcher.dispatch(envelope, processing.clone()).await {
                    error!(
                        endpoint = %address,
                        worker = index,
                        %message_id,
                        error = %e,
                        "Message processing failed"
                    );
                }
            }
            debug!(endpoint = %address, worker = index, "Worker stopped");
        })
    }
}

#[async_trait]
impl ReceiveEndpoint for InMemoryReceiveEndpoint {
    fn address(&self) -> &EndpointAddress {
        &self.address
    }

    async fn start(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(BusError::EndpointAlreadyRunning {
                address: self.address.to_string(),
            });
        }

        for message_type in self.dispatcher.subscriptions() {
            self.broker.bind(&message_type, self.queue.clone());
        }

        let stop = CancellationToken::new();
        let workers = (0..self.worker_count)
            .map(|index| self.spawn_worker(index, stop.clone()))
            .collect();
        *state = Some(Running { stop, workers });
        self.running.store(true, Ordering::Release);

        info!(endpoint = %self.address, workers = self.worker_count, "Receive endpoint started");
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        running.stop.cancel();

        for worker in running.workers {
            if let Err(e) = worker.await {
                error!(endpoint = %self.address, error = %e, "Worker task failed");
            }
        }
        info!(endpoint = %self.address, "Receive endpoint stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageEnvelope;
    use crate::message::MessageType;
    use smallvec::smallvec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowDispatcher {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
        delay: Duration,
    }

    impl SlowDispatcher {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl EnvelopeDispatcher for SlowDispatcher {
        fn subscriptions(&self) -> Vec<MessageType> {
            vec![MessageType::from("test:Work")]
        }

        async fn dispatch(&self, envelope: MessageEnvelope, _cancellation: CancellationToken) -> BusResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            if envelope.body() == b"fail" {
                return Err(BusError::transport("boom"));
            }
            Ok(())
        }
    }

    fn endpoint(dispatcher: Arc<SlowDispatcher>, workers: usize) -> (InMemoryReceiveEndpoint, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = broker.queue("work");
        let address = EndpointAddress::new("inmemory", "work").unwrap();
        (
            InMemoryReceiveEndpoint::new(address, queue, broker.clone(), dispatcher, workers),
            broker,
        )
    }

    fn work(body: &[u8]) -> MessageEnvelope {
        MessageEnvelope::create(smallvec![MessageType::from("test:Work")], body.to_vec(), None)
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let dispatcher = Arc::new(SlowDispatcher::new(Duration::ZERO));
        let (endpoint, _) = endpoint(dispatcher, 1);

        endpoint.stop().await.unwrap();
        endpoint.start().await.unwrap();
        assert!(endpoint.is_running());
        assert!(matches!(
            endpoint.start().await,
            Err(BusError::EndpointAlreadyRunning { .. })
        ));
        endpoint.stop().await.unwrap();
        endpoint.stop().await.unwrap();
        assert!(!endpoint.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_process_concurrently_and_survive_failures() {
        let dispatcher = Arc::new(SlowDispatcher::new(Duration::from_millis(20)));
        let (endpoint, broker) = endpoint(dispatcher.clone(), 4);
        endpoint.start().await.unwrap();

        for i in 0..12 {
            let body: &[u8] = if i % 3 == 0 { b"fail" } else { b"ok" };
            broker.publish(&work(body)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.completed.load(Ordering::SeqCst) < 12 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let max = dispatcher.max_in_flight.load(Ordering::SeqCst);
        assert!(max > 1 && max <= 4, "max in flight was {max}");
        endpoint.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_message() {
        let dispatcher = Arc::new(SlowDispatcher::new(Duration::from_millis(50)));
        let (endpoint, broker) = endpoint(dispatcher.clone(), 1);
        endpoint.start().await.unwrap();

        broker.publish(&work(b"ok")).await.unwrap();
        while dispatcher.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        endpoint.stop().await.unwrap();
        assert_eq!(dispatcher.completed.load(Ordering::SeqCst), 1);
    }
}
