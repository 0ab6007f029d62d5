use crate::error::QueueError;
use async_trait::async_trait;
use model::core::identifiers::{BatchId, ItemId};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// One dispatched work item on the wire. `attempt` starts at 1 and is
/// incremented on every redelivery.
#[derive(Debug, Clone)]
pub struct WorkMessage {
    pub batch_id: BatchId,
    pub item_id: ItemId,
    pub payload: String,
    pub attempt: u32,
}

/// A message held by a consumer until it is acked or nacked.
///
/// Ack means "my durable side effects for this message are committed";
/// nack means anything less. The queue redelivers nacked messages, so a
/// handler that acks optimistically loses work silently.
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &WorkMessage;

    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    async fn nack(self: Box<Self>) -> Result<(), QueueError>;
}

/// At-least-once work distribution. Implementations must redeliver
/// unacked messages; consumers must tolerate duplicates.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, msg: WorkMessage) -> Result<(), QueueError>;

    /// Next message, or `None` once the queue is closed and drained.
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, QueueError>;
}

struct QueueInner {
    tx: mpsc::UnboundedSender<WorkMessage>,
    max_redeliveries: u32,
    /// Messages that exhausted their redeliveries. Their items stay
    /// non-terminal, which is what the stall detector keys on.
    parked: StdMutex<Vec<WorkMessage>>,
}

/// In-process `WorkQueue` over an unbounded channel. Nack re-enqueues
/// with an incremented attempt counter until `max_redeliveries` is
/// exhausted, after which the message is parked.
pub struct InProcessQueue {
    inner: Arc<QueueInner>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkMessage>>,
}

impl InProcessQueue {
    pub fn new(max_redeliveries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        InProcessQueue {
            inner: Arc::new(QueueInner {
                tx,
                max_redeliveries,
                parked: StdMutex::new(Vec::new()),
            }),
            rx: Mutex::new(rx),
        }
    }

    /// Messages that ran out of redeliveries.
    pub fn parked(&self) -> Vec<WorkMessage> {
        self.inner
            .parked
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkQueue for InProcessQueue {
    async fn publish(&self, msg: WorkMessage) -> Result<(), QueueError> {
        self.inner.tx.send(msg).map_err(|_| QueueError::Closed)
    }

    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => Ok(Some(Box::new(InProcessDelivery {
                msg,
                inner: self.inner.clone(),
            }))),
            None => Ok(None),
        }
    }
}

struct InProcessDelivery {
    msg: WorkMessage,
    inner: Arc<QueueInner>,
}

#[async_trait]
impl Delivery for InProcessDelivery {
    fn message(&self) -> &WorkMessage {
        &self.msg
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), QueueError> {
        let mut msg = self.msg;

        if msg.attempt > self.inner.max_redeliveries {
            warn!(
                batch_id = %msg.batch_id,
                item_id = %msg.item_id,
                attempt = msg.attempt,
                "Redeliveries exhausted; parking message"
            );
            if let Ok(mut parked) = self.inner.parked.lock() {
                parked.push(msg);
            }
            return Ok(());
        }

        msg.attempt += 1;
        let item_id = msg.item_id.to_string();
        self.inner
            .tx
            .send(msg)
            .map_err(|e| QueueError::Redelivery {
                item_id,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(item: &str) -> WorkMessage {
        WorkMessage {
            batch_id: BatchId::new("b1"),
            item_id: ItemId::new(item),
            payload: "{}".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let queue = InProcessQueue::new(3);
        queue.publish(msg("i1")).await.unwrap();

        let delivery = queue.next().await.unwrap().unwrap();
        assert_eq!(delivery.message().attempt, 1);
        delivery.nack().await.unwrap();

        let redelivered = queue.next().await.unwrap().unwrap();
        assert_eq!(redelivered.message().attempt, 2);
        assert_eq!(redelivered.message().item_id.as_str(), "i1");
    }

    #[tokio::test]
    async fn exhausted_redeliveries_park_the_message() {
        let queue = InProcessQueue::new(1);
        queue.publish(msg("i1")).await.unwrap();

        let first = queue.next().await.unwrap().unwrap();
        first.nack().await.unwrap();

        let second = queue.next().await.unwrap().unwrap();
        assert_eq!(second.message().attempt, 2);
        second.nack().await.unwrap();

        assert_eq!(queue.parked().len(), 1);
    }

    #[tokio::test]
    async fn ack_consumes_the_message() {
        let queue = InProcessQueue::new(3);
        queue.publish(msg("i1")).await.unwrap();

        let delivery = queue.next().await.unwrap().unwrap();
        delivery.ack().await.unwrap();

        assert!(queue.parked().is_empty());
    }
}
