use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Durable breaker state for one (processor, resource_key).
///
/// Mutated only through compare-and-swap on `version`: concurrent
/// invocations race on the same key, and a losing writer must re-read
/// rather than overwrite. Open never decays by elapsed time alone; only a
/// readiness probe reporting the upstream precondition true moves it to
/// HalfOpen.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Set while the single HalfOpen trial attempt is in flight.
    pub half_open_claimed: bool,
    pub version: u64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_probe_at: None,
            half_open_claimed: false,
            version: 0,
        }
    }
}

impl CircuitRecord {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Next version of this record with the version counter bumped.
    pub fn bump(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }
}
