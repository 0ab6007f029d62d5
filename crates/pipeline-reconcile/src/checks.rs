use crate::{
    collaborators::{ExpectedCounts, PhaseCounts},
    error::CollaboratorError,
    severity::SeverityThresholds,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use model::report::{CheckResult, Severity};

/// Collaborator handles passed to each cross-phase check.
pub struct CheckContext<'a> {
    pub date: NaiveDate,
    pub expected: &'a dyn ExpectedCounts,
    pub phases: &'a dyn PhaseCounts,
    pub thresholds: SeverityThresholds,
}

/// An invariant spanning more than one phase pair. Returns `Ok(None)` when
/// the invariant holds or the check does not apply to this date.
#[async_trait]
pub trait CrossCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<Option<CheckResult>, CollaboratorError>;
}

/// Units that produced downstream output must carry at least one valid
/// sub-record. A populated unit phase with an empty sub-record phase means
/// the expansion step silently produced nothing.
pub struct NonZeroSubRecords {
    name: String,
    unit_phase: String,
    sub_phase: String,
}

impl NonZeroSubRecords {
    pub fn new(unit_phase: impl Into<String>, sub_phase: impl Into<String>) -> Self {
        let unit_phase = unit_phase.into();
        let sub_phase = sub_phase.into();
        NonZeroSubRecords {
            name: format!("{unit_phase}-has-{sub_phase}"),
            unit_phase,
            sub_phase,
        }
    }
}

#[async_trait]
impl CrossCheck for NonZeroSubRecords {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<Option<CheckResult>, CollaboratorError> {
        let units = ctx.phases.phase_count(&self.unit_phase, ctx.date).await?;
        let subs = ctx.phases.phase_count(&self.sub_phase, ctx.date).await?;

        let (Some(units), Some(subs)) = (units, subs) else {
            return Err(CollaboratorError::Unavailable(format!(
                "no counts for phases '{}'/'{}' on {}",
                self.unit_phase, self.sub_phase, ctx.date
            )));
        };

        if units > 0 && subs == 0 {
            return Ok(Some(CheckResult {
                phase_pair: format!("{}->{}", self.unit_phase, self.sub_phase),
                expected_count: units,
                actual_count: 0,
                severity: Severity::High,
                message: format!(
                    "{units} units in '{}' but zero valid sub-records in '{}'",
                    self.unit_phase, self.sub_phase
                ),
            }));
        }

        Ok(None)
    }
}

/// Derived outputs must cover at least `min_ratio` of the eligible inputs.
/// The shortfall below the floor is graded with the regular gap thresholds.
pub struct CoverageFloor {
    name: String,
    input_phase: String,
    derived_phase: String,
    min_ratio: f64,
}

impl CoverageFloor {
    pub fn new(
        input_phase: impl Into<String>,
        derived_phase: impl Into<String>,
        min_ratio: f64,
    ) -> Self {
        let input_phase = input_phase.into();
        let derived_phase = derived_phase.into();
        CoverageFloor {
            name: format!("{derived_phase}-coverage"),
            input_phase,
            derived_phase,
            min_ratio: min_ratio.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl CrossCheck for CoverageFloor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<Option<CheckResult>, CollaboratorError> {
        let inputs = ctx.phases.phase_count(&self.input_phase, ctx.date).await?;
        let derived = ctx.phases.phase_count(&self.derived_phase, ctx.date).await?;

        let (Some(inputs), Some(derived)) = (inputs, derived) else {
            return Err(CollaboratorError::Unavailable(format!(
                "no counts for phases '{}'/'{}' on {}",
                self.input_phase, self.derived_phase, ctx.date
            )));
        };

        let required = (inputs as f64 * self.min_ratio).ceil() as u64;
        if derived >= required {
            return Ok(None);
        }

        let severity = ctx
            .thresholds
            .grade(required, derived)
            .unwrap_or(Severity::Low);

        Ok(Some(CheckResult {
            phase_pair: format!("{}->{}", self.input_phase, self.derived_phase),
            expected_count: required,
            actual_count: derived,
            severity,
            message: format!(
                "coverage {derived}/{inputs} is below the {:.0}% floor for '{}'",
                self.min_ratio * 100.0,
                self.derived_phase
            ),
        }))
    }
}
