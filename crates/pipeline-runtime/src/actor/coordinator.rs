use crate::{
    actor::{
        actor::{Actor, ActorContext},
        messages::{BatchDescriptor, CoordinatorMsg},
    },
    consolidate::Consolidator,
    error::{ActorError, CoordinatorError},
    queue::{WorkMessage, WorkQueue},
};
use async_trait::async_trait;
use chrono::Utc;
use model::{
    core::identifiers::BatchId,
    events::{BatchFinalized, BatchStarted, ItemCompleted, StallDetected},
    records::batch::{
        BatchRecord, BatchStatus, CompletionEvent, CompletionStatus, ItemStatus, WorkItemRecord,
    },
};
use pipeline_core::{
    event_bus::EventBus,
    metrics::Metrics,
    state::{BatchStore, StagingStore},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the lifecycle of every batch: fan-out, completion accounting,
/// stall detection, and the exactly-once consolidation trigger.
///
/// Completion events are at-least-once. The item record is the
/// deduplication point: only the event that moves an item to a terminal
/// state may touch the batch counters, so redeliveries are no-ops.
pub struct CoordinatorActor {
    batches: Arc<dyn BatchStore>,
    staging: Arc<dyn StagingStore>,
    queue: Arc<dyn WorkQueue>,
    consolidator: Arc<dyn Consolidator>,
    bus: EventBus,
    metrics: Metrics,
    default_stall_threshold_secs: u64,
}

impl CoordinatorActor {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        staging: Arc<dyn StagingStore>,
        queue: Arc<dyn WorkQueue>,
        consolidator: Arc<dyn Consolidator>,
        bus: EventBus,
        metrics: Metrics,
        default_stall_threshold_secs: u64,
    ) -> Self {
        CoordinatorActor {
            batches,
            staging,
            queue,
            consolidator,
            bus,
            metrics,
            default_stall_threshold_secs,
        }
    }

    async fn start_batch(
        &self,
        descriptor: BatchDescriptor,
    ) -> Result<BatchId, CoordinatorError> {
        let batch_id = BatchId::generate();
        let now = Utc::now();

        let record = BatchRecord {
            batch_id: batch_id.clone(),
            processor: descriptor.processor.clone(),
            identifier: descriptor.identifier.clone(),
            created_at: now,
            total_items: descriptor.items.len() as u64,
            items_done: 0,
            items_failed: 0,
            status: BatchStatus::Running,
            last_progress_at: now,
            stall_threshold_secs: descriptor
                .stall_threshold_secs
                .unwrap_or(self.default_stall_threshold_secs),
            consolidated: false,
            version: 0,
        };

        self.batches.insert_batch(&record).await?;

        for item in &descriptor.items {
            self.batches
                .insert_item(&WorkItemRecord {
                    item_id: item.item_id.clone(),
                    batch_id: batch_id.clone(),
                    payload: item.payload.clone(),
                    status: ItemStatus::Pending,
                    staging_key: None,
                    written_count: 0,
                    version: 0,
                })
                .await?;
        }

        // Items are persisted before any is dispatched, so a completion
        // event can never reference an item the store has not seen.
        for item in descriptor.items {
            self.queue
                .publish(WorkMessage {
                    batch_id: batch_id.clone(),
                    item_id: item.item_id,
                    payload: item.payload,
                    attempt: 1,
                })
                .await?;
        }

        info!(
            batch_id = %batch_id,
            processor = %descriptor.processor,
            identifier = %descriptor.identifier,
            total_items = record.total_items,
            "Batch started"
        );
        self.bus
            .publish(BatchStarted {
                batch_id: batch_id.to_string(),
                processor: descriptor.processor.to_string(),
                identifier: descriptor.identifier.to_string(),
                total_items: record.total_items,
                timestamp: now,
            })
            .await;

        if record.total_items == 0 {
            self.complete_batch(&batch_id).await?;
        }

        Ok(batch_id)
    }

    async fn handle_completion(&self, event: CompletionEvent) -> Result<(), CoordinatorError> {
        let made_terminal = loop {
            let Some(item) = self.batches.item(&event.batch_id, &event.item_id).await? else {
                warn!(
                    batch_id = %event.batch_id,
                    item_id = %event.item_id,
                    "Completion event for unknown item; ignoring"
                );
                return Ok(());
            };

            if item.status.is_terminal() {
                debug!(
                    batch_id = %event.batch_id,
                    item_id = %event.item_id,
                    "Duplicate completion event; no-op"
                );
                break false;
            }

            let mut next = item.bump();
            next.status = match event.status {
                CompletionStatus::Done => ItemStatus::Done,
                CompletionStatus::Failed => ItemStatus::Failed,
            };
            next.staging_key = event.staging_key.clone();
            next.written_count = event.written_count;

            if self.batches.cas_item(&item, &next).await? {
                break true;
            }
        };

        if !made_terminal {
            return Ok(());
        }

        match event.status {
            CompletionStatus::Done => self.metrics.increment_items_completed(1),
            CompletionStatus::Failed => self.metrics.increment_items_failed(1),
        }

        self.bus
            .publish(ItemCompleted {
                batch_id: event.batch_id.to_string(),
                item_id: event.item_id.to_string(),
                status: event.status,
                written_count: event.written_count,
                timestamp: event.at,
            })
            .await;

        loop {
            let Some(batch) = self.batches.batch(&event.batch_id).await? else {
                return Ok(());
            };

            if batch.status.is_terminal() {
                info!(
                    batch_id = %event.batch_id,
                    item_id = %event.item_id,
                    "Completion arrived after batch finalization; counters stay frozen"
                );
                return Ok(());
            }

            let mut next = batch.bump();
            match event.status {
                CompletionStatus::Done => next.items_done += 1,
                CompletionStatus::Failed => next.items_failed += 1,
            }
            next.last_progress_at = Utc::now();

            if self.batches.cas_batch(&batch, &next).await? {
                if next.all_items_terminal() {
                    self.complete_batch(&event.batch_id).await?;
                }
                return Ok(());
            }
        }
    }

    async fn status(&self, batch_id: &BatchId) -> Result<BatchRecord, CoordinatorError> {
        self.batches
            .batch(batch_id)
            .await?
            .ok_or_else(|| CoordinatorError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })
    }

    async fn check_stalled(&self) -> Result<Vec<BatchId>, CoordinatorError> {
        let running = self.batches.running_batches().await?;
        let now = Utc::now();
        let mut stalled = Vec::new();

        for batch in running {
            let idle_secs = now
                .signed_duration_since(batch.last_progress_at)
                .num_seconds();
            if idle_secs < batch.stall_threshold_secs as i64 || batch.outstanding() == 0 {
                continue;
            }

            warn!(
                batch_id = %batch.batch_id,
                outstanding = batch.outstanding(),
                idle_secs = idle_secs,
                "Batch stalled; force-finalizing with partial results"
            );
            self.bus
                .publish(StallDetected {
                    batch_id: batch.batch_id.to_string(),
                    outstanding_items: batch.outstanding(),
                    timestamp: now,
                })
                .await;

            self.force_finalize(&batch.batch_id).await?;
            stalled.push(batch.batch_id);
        }

        Ok(stalled)
    }

    /// Normal completion path: Running -> Completed, then consolidate.
    async fn complete_batch(&self, batch_id: &BatchId) -> Result<(), CoordinatorError> {
        if let Some(record) = self
            .transition(batch_id, BatchStatus::Running, BatchStatus::Completed)
            .await?
        {
            self.publish_finalized(&record).await;
        }
        self.consolidate_once(batch_id).await
    }

    /// Stall path: Running -> Stalled, consolidate what is staged, then
    /// settle on CompletedWithPartial. The intermediate Stalled status is
    /// observable, so a crash mid-path is distinguishable from a clean
    /// partial completion.
    async fn force_finalize(&self, batch_id: &BatchId) -> Result<(), CoordinatorError> {
        if self
            .transition(batch_id, BatchStatus::Running, BatchStatus::Stalled)
            .await?
            .is_none()
        {
            // Another writer already took this batch terminal.
            return Ok(());
        }

        self.consolidate_once(batch_id).await?;

        if let Some(record) = self
            .transition(
                batch_id,
                BatchStatus::Stalled,
                BatchStatus::CompletedWithPartial,
            )
            .await?
        {
            self.publish_finalized(&record).await;
        }

        Ok(())
    }

    /// CAS the batch from `from` to `to`. Returns the updated record, or
    /// `None` when the batch was not in `from` (another writer won).
    async fn transition(
        &self,
        batch_id: &BatchId,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<Option<BatchRecord>, CoordinatorError> {
        loop {
            let Some(current) = self.batches.batch(batch_id).await? else {
                return Err(CoordinatorError::UnknownBatch {
                    batch_id: batch_id.to_string(),
                });
            };

            if current.status != from {
                return Ok(None);
            }

            let mut next = current.bump();
            next.status = to;

            if self.batches.cas_batch(&current, &next).await? {
                return Ok(Some(next));
            }
        }
    }

    /// Merge staged results and set the `consolidated` flag, exactly once
    /// from the observer's point of view. The flag is written only after
    /// the merge commits; a crash in between re-merges idempotently.
    async fn consolidate_once(&self, batch_id: &BatchId) -> Result<(), CoordinatorError> {
        loop {
            let Some(current) = self.batches.batch(batch_id).await? else {
                return Ok(());
            };

            if current.consolidated {
                return Ok(());
            }

            let staged = self.staging.staged(batch_id).await?;
            self.consolidator.consolidate(batch_id, &staged).await?;

            let mut next = current.bump();
            next.consolidated = true;

            if self.batches.cas_batch(&current, &next).await? {
                return Ok(());
            }
        }
    }

    async fn publish_finalized(&self, record: &BatchRecord) {
        self.metrics.increment_batches_finalized(1);
        info!(
            batch_id = %record.batch_id,
            status = ?record.status,
            items_done = record.items_done,
            items_failed = record.items_failed,
            "Batch finalized"
        );
        self.bus
            .publish(BatchFinalized {
                batch_id: record.batch_id.to_string(),
                status: record.status,
                items_done: record.items_done,
                items_failed: record.items_failed,
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[async_trait]
impl Actor<CoordinatorMsg> for CoordinatorActor {
    async fn handle(
        &mut self,
        msg: CoordinatorMsg,
        _ctx: &ActorContext,
    ) -> Result<(), ActorError> {
        match msg {
            CoordinatorMsg::Start { descriptor, reply } => {
                let result = self.start_batch(descriptor).await;
                let _ = reply.send(result);
            }
            CoordinatorMsg::Completion { event } => {
                if let Err(e) = self.handle_completion(event).await {
                    return Err(ActorError::Internal(e.to_string()));
                }
            }
            CoordinatorMsg::Status { batch_id, reply } => {
                let _ = reply.send(self.status(&batch_id).await);
            }
            CoordinatorMsg::CheckStalled { reply } => {
                let _ = reply.send(self.check_stalled().await);
            }
        }
        Ok(())
    }
}
