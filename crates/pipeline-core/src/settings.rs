use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Engine tuning knobs. Every field has a usable default; a settings file
/// only needs to name the fields it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Consecutive breaker-relevant failures before a circuit opens.
    pub failure_threshold: u32,

    /// Minimum spacing between readiness probes against one resource.
    pub min_probe_interval_secs: u64,

    /// Liveness beat spacing for in-flight attempts. Zero disables beats.
    pub heartbeat_interval_secs: u64,

    /// How long a running batch may go without item progress before it is
    /// force-finalized.
    pub stall_threshold_secs: u64,

    /// Redeliveries a work item gets before it is parked as failed.
    pub max_redeliveries: u32,

    /// Concurrent workers draining the item queue.
    pub worker_count: usize,

    /// Reconciliation gap ratio at or above which a gap grades Medium.
    pub medium_gap_ratio: f64,

    /// Reconciliation gap ratio at or above which a gap grades High.
    pub high_gap_ratio: f64,

    /// Directory for the durable state database. `None` means the caller
    /// picks a platform default.
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            min_probe_interval_secs: 60,
            heartbeat_interval_secs: 30,
            stall_threshold_secs: 3600,
            max_redeliveries: 3,
            worker_count: 4,
            medium_gap_ratio: 0.1,
            high_gap_ratio: 0.5,
            state_dir: None,
        }
    }
}

impl EngineSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let settings: EngineSettings =
            serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.failure_threshold == 0 {
            return Err(SettingsError::Invalid(
                "failure_threshold must be at least 1".into(),
            ));
        }

        if self.worker_count == 0 {
            return Err(SettingsError::Invalid(
                "worker_count must be at least 1".into(),
            ));
        }

        if self.stall_threshold_secs == 0 {
            return Err(SettingsError::Invalid(
                "stall_threshold_secs must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.medium_gap_ratio)
            || !(0.0..=1.0).contains(&self.high_gap_ratio)
        {
            return Err(SettingsError::Invalid(
                "gap ratios must be between 0.0 and 1.0".into(),
            ));
        }

        if self.medium_gap_ratio > self.high_gap_ratio {
            return Err(SettingsError::Invalid(
                "medium_gap_ratio must not exceed high_gap_ratio".into(),
            ));
        }

        Ok(())
    }
}
