use crate::error::{CollaboratorError, ReconcileError};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

/// Source-of-truth schedule: how many units should exist for a date.
/// `None` means the schedule has no entry for that date.
#[async_trait]
pub trait ExpectedCounts: Send + Sync {
    async fn expected_units(&self, date: NaiveDate) -> Result<Option<u64>, CollaboratorError>;
}

/// Warehouse row counts per phase and date. `None` means the phase has no
/// data for that date (which is itself a finding for the caller to grade).
#[async_trait]
pub trait PhaseCounts: Send + Sync {
    async fn phase_count(
        &self,
        phase: &str,
        date: NaiveDate,
    ) -> Result<Option<u64>, CollaboratorError>;
}

#[derive(Debug, Clone, Deserialize)]
struct DayCounts {
    #[serde(default)]
    expected_units: Option<u64>,
    #[serde(default)]
    phases: HashMap<String, u64>,
}

/// File-backed collaborator for operator runs: a JSON document mapping
/// dates to the schedule's expected unit count and per-phase row counts.
///
/// ```json
/// {
///   "2026-08-06": {
///     "expected_units": 9,
///     "phases": { "staged": 9, "published": 7 }
///   }
/// }
/// ```
pub struct CountsFile {
    days: HashMap<NaiveDate, DayCounts>,
}

impl CountsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReconcileError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let days = serde_json::from_str(&raw).map_err(|source| ReconcileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(CountsFile { days })
    }
}

#[async_trait]
impl ExpectedCounts for CountsFile {
    async fn expected_units(&self, date: NaiveDate) -> Result<Option<u64>, CollaboratorError> {
        Ok(self.days.get(&date).and_then(|d| d.expected_units))
    }
}

#[async_trait]
impl PhaseCounts for CountsFile {
    async fn phase_count(
        &self,
        phase: &str,
        date: NaiveDate,
    ) -> Result<Option<u64>, CollaboratorError> {
        Ok(self
            .days
            .get(&date)
            .and_then(|d| d.phases.get(phase).copied()))
    }
}
