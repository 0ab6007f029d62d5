use crate::error::CliError;
use async_trait::async_trait;
use model::{
    core::identifiers::{Identifier, ItemId, ProcessorName, ResourceKey},
    records::{batch::BatchStatus, run::FailureCategory},
};
use pipeline_processing::{
    guard::{AlwaysReady, ReadinessProbe},
    runner::{ExecutionContext, ExecutionOutput, Processor, ProcessorFailure},
};
use pipeline_runtime::{
    actor::messages::{BatchDescriptor, WorkItem},
    control::ControlService,
    queue::WorkMessage,
    worker::{ItemFailure, ItemHandler, ItemOutput},
};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handler for operator-submitted batches: the item payload already is the
/// final record, so processing stages it unchanged.
pub struct PassThroughHandler;

#[async_trait]
impl ItemHandler for PassThroughHandler {
    async fn process(&self, msg: &WorkMessage) -> Result<ItemOutput, ItemFailure> {
        Ok(ItemOutput {
            payload: msg.payload.clone(),
            written_count: 1,
        })
    }
}

#[derive(Deserialize)]
struct ItemEntry {
    item_id: String,
    payload: serde_json::Value,
}

/// Reads the items file: a JSON array of `{"item_id": ..., "payload": ...}`
/// entries. Payloads are carried through the runtime as raw JSON text.
pub fn load_items(path: &str) -> Result<Vec<WorkItem>, CliError> {
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<ItemEntry> = serde_json::from_str(&raw)?;

    entries
        .into_iter()
        .map(|entry| {
            let payload = serde_json::to_string(&entry.payload).map_err(CliError::JsonSerialize)?;
            Ok(WorkItem {
                item_id: ItemId::new(entry.item_id),
                payload,
            })
        })
        .collect()
}

/// Processor that runs one operator-submitted batch through the batch
/// runtime: open the batch, poll it to a terminal state, and map the final
/// counters onto the attempt outcome.
pub struct BatchProcessor {
    name: ProcessorName,
    control: ControlService,
    items: Vec<WorkItem>,
    probe: AlwaysReady,
}

impl BatchProcessor {
    pub fn new(name: ProcessorName, control: ControlService, items: Vec<WorkItem>) -> Self {
        BatchProcessor {
            name,
            control,
            items,
            probe: AlwaysReady,
        }
    }

    /// Hands the runtime back so the caller can shut it down after the run.
    pub fn into_control(self) -> ControlService {
        self.control
    }
}

#[async_trait]
impl Processor for BatchProcessor {
    fn name(&self) -> ProcessorName {
        self.name.clone()
    }

    fn resource_key(&self, identifier: &Identifier) -> ResourceKey {
        ResourceKey::new(format!("batch:{}:{identifier}", self.name))
    }

    fn readiness(&self) -> &dyn ReadinessProbe {
        // Items arrive with the trigger itself, so there is no upstream
        // precondition to probe.
        &self.probe
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutput, ProcessorFailure> {
        let descriptor = BatchDescriptor {
            processor: ctx.processor.clone(),
            identifier: ctx.identifier.clone(),
            items: self.items.clone(),
            stall_threshold_secs: None,
        };

        let batch_id = self
            .control
            .start(descriptor)
            .await
            .map_err(|e| ProcessorFailure::new(FailureCategory::Unknown, e.to_string()))?;

        loop {
            let record = self
                .control
                .status(batch_id.clone())
                .await
                .map_err(|e| ProcessorFailure::new(FailureCategory::Unknown, e.to_string()))?;

            if record.status.is_terminal() {
                let written = record.items_done;
                return match record.status {
                    BatchStatus::Completed if record.items_failed == 0 => Ok(ExecutionOutput {
                        records_written: written,
                    }),
                    BatchStatus::Completed => Err(ProcessorFailure {
                        category: FailureCategory::ProcessingError,
                        message: format!(
                            "{} of {} items failed",
                            record.items_failed, record.total_items
                        ),
                        records_written: written,
                    }),
                    _ => Err(ProcessorFailure {
                        category: FailureCategory::Timeout,
                        message: format!(
                            "batch stalled with {} of {} items done",
                            record.items_done, record.total_items
                        ),
                        records_written: written,
                    }),
                };
            }

            // Stall forcing is time driven, so the status poll doubles as
            // the stall sweep for this batch.
            self.control
                .check_stalled()
                .await
                .map_err(|e| ProcessorFailure::new(FailureCategory::Unknown, e.to_string()))?;

            sleep(STATUS_POLL_INTERVAL).await;
        }
    }
}
