use pipeline_core::{error::StoreError, settings::SettingsError};
use pipeline_processing::error::RunnerError;
use pipeline_reconcile::error::ReconcileError;
use pipeline_runtime::error::CoordinatorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON input: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(serde_json::Error),

    #[error("Failed to load settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("State store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Batch coordinator operation failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Processor run failed: {0}")]
    Runner(#[from] RunnerError),

    #[error("Failed to load counts file: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Invalid phase pair '{0}', expected 'upstream:downstream'")]
    InvalidPhasePair(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}
