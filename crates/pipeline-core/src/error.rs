use thiserror::Error;

/// Errors from the durable state layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Record already exists for key '{key}'")]
    AlreadyExists { key: String },

    #[error("Attempt '{run_id}' was already finalized")]
    AlreadyFinalized { run_id: String },

    #[error("No open attempt found for run '{run_id}'")]
    UnknownAttempt { run_id: String },

    /// The ledger write for an attempt outcome did not durably commit.
    /// The outcome is unknown and must be surfaced as such, never treated
    /// as success.
    #[error("Outcome of run '{run_id}' is unknown: ledger write failed: {source}")]
    OutcomeUnknown {
        run_id: String,
        #[source]
        source: Box<StoreError>,
    },
}
