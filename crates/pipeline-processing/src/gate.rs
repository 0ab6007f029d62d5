use crate::error::GateError;
use model::{
    core::identifiers::{Identifier, ProcessorName, RunId},
    events::TriggerSuppressed,
    records::run::{DecisionRecord, GateOutcome},
};
use pipeline_core::{event_bus::EventBus, metrics::Metrics, state::RunLedger};
use std::sync::Arc;
use tracing::info;

/// Verdict of one `should_run` check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed { retry_of: Option<RunId> },
    Skip { reason: String },
}

impl GateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, GateDecision::Proceed { .. })
    }
}

/// Decides whether a trigger for (processor, identifier) is new work or a
/// duplicate of work that already produced output.
///
/// The only blocking history is a finalized `Success` that actually wrote
/// records. A zero-output success, or any failure, leaves the unit open for
/// retry. Every decision is appended to the ledger's decision keyspace for
/// audit.
pub struct IdempotencyGate {
    ledger: Arc<dyn RunLedger>,
    bus: EventBus,
    metrics: Metrics,
}

impl IdempotencyGate {
    pub fn new(ledger: Arc<dyn RunLedger>, bus: EventBus, metrics: Metrics) -> Self {
        IdempotencyGate {
            ledger,
            bus,
            metrics,
        }
    }

    pub async fn should_run(
        &self,
        processor: &ProcessorName,
        identifier: &Identifier,
        force: bool,
    ) -> Result<GateDecision, GateError> {
        let latest = self.ledger.latest_attempt(processor, identifier).await?;

        let (decision, retry_of, reason) = match latest {
            None => (
                GateDecision::Proceed { retry_of: None },
                None,
                "no prior attempt".to_string(),
            ),
            Some(record) if record.is_blocking_success() && !force => {
                let reason = format!(
                    "already succeeded with {} records written",
                    record.records_written
                );
                (
                    GateDecision::Skip {
                        reason: reason.clone(),
                    },
                    Some(record.run_id.clone()),
                    reason,
                )
            }
            Some(record) if record.is_blocking_success() => {
                let reason = format!(
                    "forced re-run over prior success ({} records written)",
                    record.records_written
                );
                (
                    GateDecision::Proceed {
                        retry_of: Some(record.run_id.clone()),
                    },
                    Some(record.run_id.clone()),
                    reason,
                )
            }
            Some(record) => {
                let reason = format!(
                    "retrying after prior {:?} ({:?})",
                    record.status, record.failure_category
                );
                info!(
                    processor = %processor,
                    identifier = %identifier,
                    prior_run = %record.run_id,
                    prior_status = ?record.status,
                    "Gate admits retry"
                );
                (
                    GateDecision::Proceed {
                        retry_of: Some(record.run_id.clone()),
                    },
                    Some(record.run_id.clone()),
                    reason,
                )
            }
        };

        let outcome = match &decision {
            GateDecision::Proceed { .. } => GateOutcome::Proceed,
            GateDecision::Skip { .. } => GateOutcome::Skip,
        };

        self.ledger
            .append_decision(&DecisionRecord {
                processor: processor.clone(),
                identifier: identifier.clone(),
                decided_at: chrono::Utc::now(),
                outcome,
                forced: force,
                retry_of,
                reason: reason.clone(),
            })
            .await?;

        if let GateDecision::Skip { .. } = &decision {
            self.metrics.increment_runs_suppressed(1);
            self.bus
                .publish(TriggerSuppressed {
                    processor: processor.to_string(),
                    identifier: identifier.to_string(),
                    reason,
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }

        Ok(decision)
    }
}
