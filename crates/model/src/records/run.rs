use crate::core::identifiers::{Identifier, ProcessorName, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
    Partial,
}

/// Why an attempt did not produce a clean success.
///
/// `NoDataAvailable` is an expected timing condition, not a defect: it is
/// resolved locally and never escalates. `ProcessingError` and `Unknown`
/// indicate defects and are always surfaced.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    None,
    NoDataAvailable,
    UpstreamFailure,
    ProcessingError,
    Timeout,
    Unknown,
}

impl FailureCategory {
    /// Categories that indicate a defect rather than a timing condition.
    pub fn is_alertable(&self) -> bool {
        matches!(
            self,
            FailureCategory::ProcessingError | FailureCategory::Unknown
        )
    }

    /// Categories that count toward the circuit breaker's consecutive-failure
    /// counter. `NoDataAvailable` never does: the readiness guard resolves it
    /// before the attempt becomes a real failure.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            FailureCategory::UpstreamFailure
                | FailureCategory::ProcessingError
                | FailureCategory::Timeout
                | FailureCategory::Unknown
        )
    }
}

/// How one attempt ended. Finalized into a `RunRecord` exactly once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success {
        records_written: u64,
    },
    Partial {
        records_written: u64,
        category: FailureCategory,
        message: String,
    },
    Skipped {
        category: FailureCategory,
        reason: String,
    },
    Failed {
        category: FailureCategory,
        message: String,
    },
}

impl AttemptOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            AttemptOutcome::Success { .. } => RunStatus::Success,
            AttemptOutcome::Partial { .. } => RunStatus::Partial,
            AttemptOutcome::Skipped { .. } => RunStatus::Skipped,
            AttemptOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn records_written(&self) -> u64 {
        match self {
            AttemptOutcome::Success { records_written }
            | AttemptOutcome::Partial {
                records_written, ..
            } => *records_written,
            _ => 0,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            AttemptOutcome::Success { .. } => FailureCategory::None,
            AttemptOutcome::Partial { category, .. }
            | AttemptOutcome::Skipped { category, .. }
            | AttemptOutcome::Failed { category, .. } => *category,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            AttemptOutcome::Success { .. } => None,
            AttemptOutcome::Partial { message, .. } | AttemptOutcome::Failed { message, .. } => {
                Some(message.clone())
            }
            AttemptOutcome::Skipped { reason, .. } => Some(reason.clone()),
        }
    }
}

/// An attempt that has been opened in the ledger but not yet finalized.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OpenAttempt {
    pub run_id: RunId,
    pub seq: u64,
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub started_at: DateTime<Utc>,
}

/// One finalized attempt of one processor against one logical unit of work.
///
/// Append-only: never mutated or deleted after finalization. `seq` is the
/// ledger's own monotonic sequence and is the tie-break for "most recent
/// finalized record"; wall-clock timestamps are audit data only.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunRecord {
    pub run_id: RunId,
    pub seq: u64,
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_written: u64,
    pub failure_category: FailureCategory,
    pub error_message: Option<String>,
}

impl RunRecord {
    /// A success that wrote nothing is a distinct, retryable state. Treating
    /// it as "nothing left to do" silently suppresses the later attempt that
    /// would have found real data.
    pub fn is_blocking_success(&self) -> bool {
        self.status == RunStatus::Success && self.records_written > 0
    }
}

/// Which way the idempotency gate ruled on a trigger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    Skip,
}

/// Audit entry for one `should_run` decision. Stored in its own keyspace,
/// never mixed into latest-attempt queries.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DecisionRecord {
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub decided_at: DateTime<Utc>,
    pub outcome: GateOutcome,
    pub forced: bool,
    pub retry_of: Option<RunId>,
    pub reason: String,
}

/// Liveness signal emitted by a long-running attempt so that a stuck
/// operation is distinguishable from a completed one.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HeartbeatEntry {
    pub run_id: RunId,
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub at: DateTime<Utc>,
}
