use crate::{
    breaker::CircuitBreaker,
    error::RunnerError,
    gate::{GateDecision, IdempotencyGate},
    guard::{Readiness, ReadinessContext, ReadinessProbe},
};
use async_trait::async_trait;
use model::{
    core::identifiers::{Identifier, ProcessorName, ResourceKey, RunId},
    events::{RunFinalized, RunStarted},
    records::run::{AttemptOutcome, FailureCategory, RunRecord},
};
use pipeline_core::{
    event_bus::EventBus, heartbeat::Heartbeater, metrics::Metrics, state::RunLedger,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// What a successful execution produced.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutput {
    pub records_written: u64,
}

/// A failed execution, already classified by the processor.
///
/// `records_written` is nonzero when the processor committed some output
/// before failing; the attempt then finalizes as `Partial` rather than
/// `Failed`.
#[derive(Debug, Error)]
#[error("{category:?}: {message}")]
pub struct ProcessorFailure {
    pub category: FailureCategory,
    pub message: String,
    pub records_written: u64,
}

impl ProcessorFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            records_written: 0,
        }
    }
}

/// Identity of the attempt handed to `Processor::execute`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub resource_key: ResourceKey,
}

/// One pipeline phase. Implementations hold their own upstream handles;
/// the runner only cares about identity, readiness, and the outcome.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> ProcessorName;

    /// The upstream resource this processor's circuit is keyed by.
    fn resource_key(&self, identifier: &Identifier) -> ResourceKey;

    fn readiness(&self) -> &dyn ReadinessProbe;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutput, ProcessorFailure>;
}

/// How one invocation resolved, from the caller's point of view.
#[derive(Debug)]
pub enum RunOutcome {
    /// An attempt was opened and finalized; here is its record.
    Completed(RunRecord),
    /// No attempt was opened at all (gate skip or open circuit).
    Skipped { reason: String },
}

/// The invocation wrapper every trigger goes through: gate, breaker,
/// ledger, guard, execute, finalize, breaker feedback.
///
/// The ledger attempt brackets only real work: a gate skip or an open
/// circuit produces no `RunRecord`. A guard `NotReady` does open an
/// attempt, finalized as `Skipped`/`NoDataAvailable`, and never feeds the
/// breaker's failure counter.
pub struct ProcessorRunner {
    ledger: Arc<dyn RunLedger>,
    gate: IdempotencyGate,
    breaker: CircuitBreaker,
    heartbeater: Heartbeater,
    bus: EventBus,
    metrics: Metrics,
}

impl ProcessorRunner {
    pub fn new(
        ledger: Arc<dyn RunLedger>,
        gate: IdempotencyGate,
        breaker: CircuitBreaker,
        heartbeater: Heartbeater,
        bus: EventBus,
        metrics: Metrics,
    ) -> Self {
        ProcessorRunner {
            ledger,
            gate,
            breaker,
            heartbeater,
            bus,
            metrics,
        }
    }

    pub async fn run(
        &self,
        processor: &dyn Processor,
        identifier: &Identifier,
        force: bool,
    ) -> Result<RunOutcome, RunnerError> {
        let name = processor.name();

        match self.gate.should_run(&name, identifier, force).await? {
            GateDecision::Skip { reason } => {
                info!(
                    processor = %name,
                    identifier = %identifier,
                    reason = %reason,
                    "Trigger suppressed by gate"
                );
                return Ok(RunOutcome::Skipped { reason });
            }
            GateDecision::Proceed { retry_of } => {
                if let Some(prior) = retry_of {
                    info!(
                        processor = %name,
                        identifier = %identifier,
                        retry_of = %prior,
                        "Proceeding as retry"
                    );
                }
            }
        }

        let key = processor.resource_key(identifier);
        let probe_ctx = ReadinessContext {
            processor: name.clone(),
            identifier: identifier.clone(),
            resource_key: key.clone(),
        };

        let mut admitted = self.breaker.allow(&name, &key).await?;
        if !admitted
            && self
                .breaker
                .probe(&name, &key, processor.readiness(), &probe_ctx)
                .await?
        {
            admitted = self.breaker.allow(&name, &key).await?;
        }

        if !admitted {
            let reason = format!("circuit open for resource '{key}'");
            info!(
                processor = %name,
                resource_key = %key,
                "Invocation blocked by open circuit"
            );
            return Ok(RunOutcome::Skipped { reason });
        }

        let attempt = self.ledger.open_attempt(&name, identifier).await?;
        self.metrics.increment_runs_started(1);
        self.bus
            .publish(RunStarted {
                run_id: attempt.run_id.to_string(),
                processor: name.to_string(),
                identifier: identifier.to_string(),
                timestamp: attempt.started_at,
            })
            .await;

        let beat = self.heartbeater.start(&attempt);

        let outcome = match processor.readiness().check(&probe_ctx).await {
            Ok(Readiness::Ready) => {
                let ctx = ExecutionContext {
                    run_id: attempt.run_id.clone(),
                    processor: name.clone(),
                    identifier: identifier.clone(),
                    resource_key: key.clone(),
                };

                match processor.execute(&ctx).await {
                    Ok(output) => AttemptOutcome::Success {
                        records_written: output.records_written,
                    },
                    Err(failure) if failure.records_written > 0 => AttemptOutcome::Partial {
                        records_written: failure.records_written,
                        category: failure.category,
                        message: failure.message,
                    },
                    Err(failure) => AttemptOutcome::Failed {
                        category: failure.category,
                        message: failure.message,
                    },
                }
            }
            Ok(Readiness::NotReady { reason }) => {
                info!(
                    processor = %name,
                    identifier = %identifier,
                    reason = %reason,
                    "Readiness guard skipped execution"
                );
                AttemptOutcome::Skipped {
                    category: FailureCategory::NoDataAvailable,
                    reason,
                }
            }
            Err(probe_err) => AttemptOutcome::Failed {
                category: FailureCategory::UpstreamFailure,
                message: probe_err.to_string(),
            },
        };

        beat.stop().await;

        // A failed finalize bubbles up as an explicit outcome-unknown
        // error; it must never read as a successful run.
        let record = self.ledger.finalize_attempt(&attempt, &outcome).await?;

        match &outcome {
            AttemptOutcome::Success { .. } => {
                self.metrics.increment_runs_succeeded(1);
                self.breaker.record_outcome(&name, &key, true).await?;
            }
            outcome if outcome.category().trips_breaker() => {
                self.metrics.increment_runs_failed(1);
                self.breaker.record_outcome(&name, &key, false).await?;
            }
            _ => {
                // No real attempt against the upstream happened; hand back
                // any HalfOpen trial slot this invocation claimed.
                self.breaker.release_claim(&name, &key).await?;
            }
        }

        if record.failure_category.is_alertable() {
            error!(
                run_id = %record.run_id,
                processor = %name,
                identifier = %identifier,
                category = ?record.failure_category,
                message = record.error_message.as_deref().unwrap_or(""),
                "Run failed with alertable category"
            );
        }

        self.bus
            .publish(RunFinalized {
                run_id: record.run_id.to_string(),
                processor: name.to_string(),
                identifier: identifier.to_string(),
                status: record.status,
                records_written: record.records_written,
                timestamp: record.completed_at.unwrap_or_else(chrono::Utc::now),
            })
            .await;

        info!(
            run_id = %record.run_id,
            processor = %name,
            identifier = %identifier,
            status = ?record.status,
            records_written = record.records_written,
            "Run finalized"
        );

        Ok(RunOutcome::Completed(record))
    }
}
