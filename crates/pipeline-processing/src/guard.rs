use crate::error::ProbeError;
use async_trait::async_trait;
use model::core::identifiers::{Identifier, ProcessorName, ResourceKey};

/// What a readiness probe learns about the upstream precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady { reason: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Everything a probe may need to evaluate its precondition.
#[derive(Debug, Clone)]
pub struct ReadinessContext {
    pub processor: ProcessorName,
    pub identifier: Identifier,
    pub resource_key: ResourceKey,
}

/// Cheap check that the data an attempt depends on actually exists.
///
/// Probes are consulted twice: by the guard immediately before execution,
/// and by the breaker to decide whether an Open circuit may move to
/// HalfOpen. They must be side-effect free against the upstream.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, ctx: &ReadinessContext) -> Result<Readiness, ProbeError>;
}

/// Probe for processors whose inputs are always present.
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn check(&self, _ctx: &ReadinessContext) -> Result<Readiness, ProbeError> {
        Ok(Readiness::Ready)
    }
}
