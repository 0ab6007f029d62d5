use crate::error::CoordinatorError;
use model::{
    core::identifiers::{BatchId, Identifier, ItemId, ProcessorName},
    records::batch::{BatchRecord, CompletionEvent},
};
use tokio::sync::oneshot;

/// One item of a batch as submitted by the caller. The payload is opaque
/// JSON text handed through to the worker unchanged.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub item_id: ItemId,
    pub payload: String,
}

/// Everything needed to open a batch.
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub items: Vec<WorkItem>,
    /// Overrides the engine-wide stall threshold when set.
    pub stall_threshold_secs: Option<u64>,
}

/// Messages for the batch coordinator actor.
#[derive(Debug)]
pub enum CoordinatorMsg {
    /// Persist a new batch, dispatch its items, reply with the id.
    Start {
        descriptor: BatchDescriptor,
        reply: oneshot::Sender<Result<BatchId, CoordinatorError>>,
    },

    /// A worker finished one item. At-least-once; duplicates are no-ops.
    Completion { event: CompletionEvent },

    /// Current batch record.
    Status {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<BatchRecord, CoordinatorError>>,
    },

    /// Scan running batches and force-finalize the stalled ones.
    CheckStalled {
        reply: oneshot::Sender<Result<Vec<BatchId>, CoordinatorError>>,
    },
}
