use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};

enum QueueSender {
    Bounded(mpsc::Sender<MessageEnvelope>),
    Unbounded(mpsc::UnboundedSender<MessageEnvelope>),
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<MessageEnvelope>),
    Unbounded(mpsc::UnboundedReceiver<MessageEnvelope>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<MessageEnvelope> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Named FIFO queue shared by any number of producers and workers.
///
/// Bounded queues make [`enqueue`](Self::enqueue) wait for space; nothing is
/// ever dropped. Unbounded queues never wait.
pub struct InMemoryQueue {
    name: String,
    capacity: Option<usize>,
    sender: QueueSender,
    receiver: Mutex<QueueReceiver>,
    depth: AtomicUsize,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        Self {
            name: name.into(),
            capacity: capacity.map(|c| c.max(1)),
            sender,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Messages enqueued and not yet dequeued.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Append an envelope, waiting for space on a full bounded queue.
    ///
    /// Cancel safe: a dropped wait enqueues nothing.
    pub async fn enqueue(&self, envelope: MessageEnvelope) -> BusResult<()> {
        match &self.sender {
            QueueSender::Bounded(tx) => {
                let permit = tx.reserve().await.map_err(|_| self.closed())?;
                // Counted before the message becomes visible to dequeue
                self.depth.fetch_add(1, Ordering::AcqRel);
                permit.send(envelope);
                Ok(())
            }
            QueueSender::Unbounded(tx) => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                tx.send(envelope).map_err(|_| {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    self.closed()
                })
            }
        }
    }

    fn closed(&self) -> BusError {
        BusError::DeliveryFailed {
            address: self.name.clone(),
            reason: "queue closed".to_string(),
        }
    }

    /// Wait for the next envelope.
    ///
    /// Cancel safe: dropping the future loses nothing.
    pub async fn dequeue(&self) -> Option<MessageEnvelope> {
        let envelope = self.receiver.lock().await.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use smallvec::smallvec;
    use std::sync::Arc;
    use std::time::Duration;

    fn envelope(n: u8) -> MessageEnvelope {
        MessageEnvelope::create(smallvec![MessageType::from("test:Ping")], vec![n], None)
    }

    #[tokio::test]
    async fn test_fifo_and_depth() {
        let queue = InMemoryQueue::new("orders", None);
        for n in 0..3 {
            queue.enqueue(envelope(n)).await.unwrap();
        }
        assert_eq!(queue.depth(), 3);

        for n in 0..3 {
            assert_eq!(queue.dequeue().await.unwrap().body(), &[n]);
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_bounded_enqueue_waits_for_space() {
        let queue = Arc::new(InMemoryQueue::new("bounded", Some(2)));
        queue.enqueue(envelope(0)).await.unwrap();
        queue.enqueue(envelope(1)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(envelope(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "third enqueue must wait while full");

        assert_eq!(queue.dequeue().await.unwrap().body(), &[0]);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(queue.dequeue().await.unwrap().body(), &[1]);
        assert_eq!(queue.dequeue().await.unwrap().body(), &[2]);
    }
}
