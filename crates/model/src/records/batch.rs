use crate::core::identifiers::{BatchId, Identifier, ItemId, ProcessorName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Completed,
    CompletedWithPartial,
    Stalled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

/// One fan-out unit of work: N independently dispatched items tracked to
/// completion.
///
/// Counters are advanced only after the per-item record has moved to a
/// terminal state, so a redelivered completion event can never
/// double-increment them. All mutation goes through compare-and-swap on
/// `version`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub created_at: DateTime<Utc>,
    pub total_items: u64,
    pub items_done: u64,
    pub items_failed: u64,
    pub status: BatchStatus,
    pub last_progress_at: DateTime<Utc>,
    pub stall_threshold_secs: u64,
    /// Guards the exactly-once consolidation trigger.
    pub consolidated: bool,
    pub version: u64,
}

impl BatchRecord {
    pub fn outstanding(&self) -> u64 {
        self.total_items
            .saturating_sub(self.items_done + self.items_failed)
    }

    pub fn all_items_terminal(&self) -> bool {
        self.items_done + self.items_failed >= self.total_items
    }

    pub fn bump(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed)
    }
}

/// One unit dispatched within a batch. The payload is opaque to the
/// coordinator and is carried as raw JSON text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkItemRecord {
    pub item_id: ItemId,
    pub batch_id: BatchId,
    pub payload: String,
    pub status: ItemStatus,
    pub staging_key: Option<String>,
    pub written_count: u64,
    pub version: u64,
}

impl WorkItemRecord {
    pub fn bump(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Done,
    Failed,
}

/// Worker → coordinator completion notice. Delivered at-least-once; the
/// coordinator treats it as idempotent by `item_id`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompletionEvent {
    pub batch_id: BatchId,
    pub item_id: ItemId,
    pub status: CompletionStatus,
    pub written_count: u64,
    pub staging_key: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// One staged per-item result awaiting consolidation, keyed by
/// (batch_id, item_id) so repeated consolidation attempts converge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StagedResult {
    pub batch_id: BatchId,
    pub item_id: ItemId,
    pub staging_key: String,
    pub payload: String,
}
