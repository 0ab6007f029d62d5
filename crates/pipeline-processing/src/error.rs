use pipeline_core::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Readiness probe failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Ledger operation failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("Circuit store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Readiness probe failed: {0}")]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Gate check failed: {0}")]
    Gate(#[from] GateError),

    #[error("Circuit breaker operation failed: {0}")]
    Breaker(#[from] BreakerError),

    #[error("Ledger operation failed: {0}")]
    Store(#[from] StoreError),
}
