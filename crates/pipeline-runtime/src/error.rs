use pipeline_core::error::StoreError;
use thiserror::Error;

/// Common error type for all actors in the runtime.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Mailbox closed")]
    MailboxClosed,

    #[error("Actor internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,

    #[error("Redelivery failed for item '{item_id}': {reason}")]
    Redelivery { item_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    #[error("Batch '{batch_id}' not found")]
    UnknownBatch { batch_id: String },

    #[error("Coordinator dropped the reply channel")]
    ReplyDropped,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),
}
