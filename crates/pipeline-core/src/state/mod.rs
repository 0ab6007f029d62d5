use crate::error::StoreError;
use async_trait::async_trait;
use model::{
    core::identifiers::{BatchId, Identifier, ItemId, ProcessorName, ResourceKey, RunId},
    records::{
        batch::{BatchRecord, StagedResult, WorkItemRecord},
        circuit::CircuitRecord,
        run::{AttemptOutcome, DecisionRecord, HeartbeatEntry, OpenAttempt, RunRecord},
    },
};

pub mod sled_store;

/// Append/query store of every processor execution attempt and its outcome.
///
/// This is the system's sole source of truth for "did this work already
/// happen". An attempt is not considered finalized until its record is
/// durably committed; a failed finalize surfaces as
/// `StoreError::OutcomeUnknown`.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Open a new attempt and assign it the ledger's next monotonic
    /// sequence number.
    async fn open_attempt(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<OpenAttempt, StoreError>;

    /// Finalize an open attempt exactly once. The resulting record is
    /// immutable and never deleted.
    async fn finalize_attempt(
        &self,
        attempt: &OpenAttempt,
        outcome: &AttemptOutcome,
    ) -> Result<RunRecord, StoreError>;

    /// Most recent finalized record for (processor, identifier), by ledger
    /// sequence. Open attempts and gate decisions never appear here.
    async fn latest_attempt(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Option<RunRecord>, StoreError>;

    /// All finalized records for (processor, identifier) in sequence order.
    async fn history(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Vec<RunRecord>, StoreError>;

    /// Audit every gate decision in its own keyspace.
    async fn append_decision(&self, record: &DecisionRecord) -> Result<(), StoreError>;

    async fn decisions(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
    ) -> Result<Vec<DecisionRecord>, StoreError>;

    async fn append_heartbeat(&self, entry: &HeartbeatEntry) -> Result<(), StoreError>;

    async fn heartbeats(&self, run_id: &RunId) -> Result<Vec<HeartbeatEntry>, StoreError>;
}

/// Versioned breaker state, mutated only via compare-and-swap.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn load(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
    ) -> Result<Option<CircuitRecord>, StoreError>;

    /// Write `next` only if the stored record still equals `expected`
    /// (`None` = no record yet). Returns false when a concurrent writer
    /// won; the caller re-reads and retries.
    async fn cas(
        &self,
        processor: &ProcessorName,
        key: &ResourceKey,
        expected: Option<&CircuitRecord>,
        next: &CircuitRecord,
    ) -> Result<bool, StoreError>;
}

/// Batch and per-item records, all CAS-versioned.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert a new batch record; fails if the id is already present.
    async fn insert_batch(&self, batch: &BatchRecord) -> Result<(), StoreError>;

    async fn batch(&self, id: &BatchId) -> Result<Option<BatchRecord>, StoreError>;

    async fn cas_batch(
        &self,
        expected: &BatchRecord,
        next: &BatchRecord,
    ) -> Result<bool, StoreError>;

    /// All batches currently in the Running state.
    async fn running_batches(&self) -> Result<Vec<BatchRecord>, StoreError>;

    async fn insert_item(&self, item: &WorkItemRecord) -> Result<(), StoreError>;

    async fn item(
        &self,
        batch_id: &BatchId,
        item_id: &ItemId,
    ) -> Result<Option<WorkItemRecord>, StoreError>;

    async fn cas_item(
        &self,
        expected: &WorkItemRecord,
        next: &WorkItemRecord,
    ) -> Result<bool, StoreError>;

    async fn items(&self, batch_id: &BatchId) -> Result<Vec<WorkItemRecord>, StoreError>;
}

/// Per-item results parked between worker completion and consolidation.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Durably stage one item result and return its staging key. The write
    /// is flushed before returning: a worker's ack must reflect a commit
    /// that actually happened.
    async fn stage(
        &self,
        batch_id: &BatchId,
        item_id: &ItemId,
        payload: &str,
    ) -> Result<String, StoreError>;

    async fn staged(&self, batch_id: &BatchId) -> Result<Vec<StagedResult>, StoreError>;
}

/// The consolidation target. `merge` is an idempotent upsert keyed by
/// (batch_id, item_id): repeated consolidation attempts converge instead of
/// duplicating.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn merge(
        &self,
        batch_id: &BatchId,
        results: &[StagedResult],
    ) -> Result<u64, StoreError>;

    async fn destination_count(&self, batch_id: &BatchId) -> Result<u64, StoreError>;
}
