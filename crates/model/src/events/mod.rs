use crate::records::batch::{BatchStatus, CompletionStatus};
use crate::records::run::RunStatus;
use std::fmt::Debug;

/// A trait for events that can be published on the EventBus.
pub trait Event: Send + Sync + Debug + 'static {
    /// Returns a unique identifier for this event type.
    fn event_type(&self) -> &'static str;
}

/// Emitted when an attempt is opened in the run ledger.
#[derive(Debug, Clone)]
pub struct RunStarted {
    pub run_id: String,
    pub processor: String,
    pub identifier: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for RunStarted {
    fn event_type(&self) -> &'static str {
        "run.started"
    }
}

/// Emitted when an attempt is finalized, whatever the outcome.
#[derive(Debug, Clone)]
pub struct RunFinalized {
    pub run_id: String,
    pub processor: String,
    pub identifier: String,
    pub status: RunStatus,
    pub records_written: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for RunFinalized {
    fn event_type(&self) -> &'static str {
        "run.finalized"
    }
}

/// Emitted when the idempotency gate suppresses a trigger.
#[derive(Debug, Clone)]
pub struct TriggerSuppressed {
    pub processor: String,
    pub identifier: String,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for TriggerSuppressed {
    fn event_type(&self) -> &'static str {
        "gate.suppressed"
    }
}

/// Emitted when a breaker crosses its failure threshold and opens.
#[derive(Debug, Clone)]
pub struct CircuitOpened {
    pub processor: String,
    pub resource_key: String,
    pub consecutive_failures: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for CircuitOpened {
    fn event_type(&self) -> &'static str {
        "circuit.opened"
    }
}

/// Emitted when a readiness probe reports the upstream ready and the
/// breaker admits one trial attempt.
#[derive(Debug, Clone)]
pub struct CircuitHalfOpened {
    pub processor: String,
    pub resource_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for CircuitHalfOpened {
    fn event_type(&self) -> &'static str {
        "circuit.half_opened"
    }
}

/// Emitted when a trial attempt succeeds and the breaker closes.
#[derive(Debug, Clone)]
pub struct CircuitClosed {
    pub processor: String,
    pub resource_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for CircuitClosed {
    fn event_type(&self) -> &'static str {
        "circuit.closed"
    }
}

/// Emitted when batch dispatch begins.
#[derive(Debug, Clone)]
pub struct BatchStarted {
    pub batch_id: String,
    pub processor: String,
    pub identifier: String,
    pub total_items: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for BatchStarted {
    fn event_type(&self) -> &'static str {
        "batch.started"
    }
}

/// Emitted once per item reaching a terminal state.
#[derive(Debug, Clone)]
pub struct ItemCompleted {
    pub batch_id: String,
    pub item_id: String,
    pub status: CompletionStatus,
    pub written_count: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for ItemCompleted {
    fn event_type(&self) -> &'static str {
        "batch.item_completed"
    }
}

/// Emitted when a batch reaches a terminal status.
#[derive(Debug, Clone)]
pub struct BatchFinalized {
    pub batch_id: String,
    pub status: BatchStatus,
    pub items_done: u64,
    pub items_failed: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for BatchFinalized {
    fn event_type(&self) -> &'static str {
        "batch.finalized"
    }
}

/// Emitted when a batch is force-finalized with items still outstanding.
#[derive(Debug, Clone)]
pub struct StallDetected {
    pub batch_id: String,
    pub outstanding_items: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for StallDetected {
    fn event_type(&self) -> &'static str {
        "batch.stall_detected"
    }
}

/// Emitted after each reconciliation cycle.
#[derive(Debug, Clone)]
pub struct ReconciliationCompleted {
    pub report_date: chrono::NaiveDate,
    pub gaps_found: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for ReconciliationCompleted {
    fn event_type(&self) -> &'static str {
        "reconciliation.completed"
    }
}

/// Periodic liveness signal from a long-running attempt.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitted {
    pub run_id: String,
    pub processor: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Event for HeartbeatEmitted {
    fn event_type(&self) -> &'static str {
        "run.heartbeat"
    }
}
