use async_trait::async_trait;
use model::{core::identifiers::BatchId, records::batch::StagedResult};
use pipeline_core::{error::StoreError, state::DestinationStore};
use std::sync::Arc;
use tracing::info;

/// Merges staged per-item results into the destination.
///
/// Must be idempotent by (batch_id, item_id): consolidation runs again
/// after crashes and after stall-forced finalization, and repeated merges
/// have to converge on the same destination state.
#[async_trait]
pub trait Consolidator: Send + Sync {
    /// Returns the number of results merged.
    async fn consolidate(
        &self,
        batch_id: &BatchId,
        staged: &[StagedResult],
    ) -> Result<u64, StoreError>;
}

/// Consolidator over the durable `DestinationStore`, whose `merge` is an
/// upsert keyed by (batch_id, item_id).
pub struct DestinationConsolidator {
    destination: Arc<dyn DestinationStore>,
}

impl DestinationConsolidator {
    pub fn new(destination: Arc<dyn DestinationStore>) -> Self {
        DestinationConsolidator { destination }
    }
}

#[async_trait]
impl Consolidator for DestinationConsolidator {
    async fn consolidate(
        &self,
        batch_id: &BatchId,
        staged: &[StagedResult],
    ) -> Result<u64, StoreError> {
        let merged = self.destination.merge(batch_id, staged).await?;
        info!(
            batch_id = %batch_id,
            staged = staged.len(),
            merged = merged,
            "Consolidated staged results"
        );
        Ok(merged)
    }
}
