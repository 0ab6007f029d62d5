use std::path::PathBuf;
use thiserror::Error;

/// A collaborator query could not be answered. The reconciliation service
/// degrades these into informational skips rather than failing the cycle.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to read counts file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse counts file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
