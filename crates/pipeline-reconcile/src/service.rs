use crate::{
    checks::{CheckContext, CrossCheck},
    collaborators::{ExpectedCounts, PhaseCounts},
    severity::SeverityThresholds,
};
use chrono::{NaiveDate, Utc};
use model::{
    events::ReconciliationCompleted,
    report::{CheckResult, PhasePair, ReconciliationReport},
};
use pipeline_core::event_bus::EventBus;
use std::sync::Arc;
use tracing::{info, warn};

/// Scheduled, strictly observational audit of the pipeline's phase counts.
///
/// The service never mutates pipeline state; it queries collaborators,
/// grades gaps, and emits a report. A collaborator that cannot answer
/// downgrades the affected check to an informational skip, so a cycle
/// always produces a report.
pub struct ReconciliationService {
    expected: Arc<dyn ExpectedCounts>,
    phases: Arc<dyn PhaseCounts>,
    pairs: Vec<PhasePair>,
    cross_checks: Vec<Box<dyn CrossCheck>>,
    thresholds: SeverityThresholds,
    /// Phase-pair upstream name that resolves against the schedule instead
    /// of a warehouse phase.
    source_phase: String,
    bus: EventBus,
}

impl ReconciliationService {
    pub fn new(
        expected: Arc<dyn ExpectedCounts>,
        phases: Arc<dyn PhaseCounts>,
        pairs: Vec<PhasePair>,
        thresholds: SeverityThresholds,
        source_phase: impl Into<String>,
        bus: EventBus,
    ) -> Self {
        ReconciliationService {
            expected,
            phases,
            pairs,
            cross_checks: Vec::new(),
            thresholds,
            source_phase: source_phase.into(),
            bus,
        }
    }

    pub fn with_cross_check(mut self, check: Box<dyn CrossCheck>) -> Self {
        self.cross_checks.push(check);
        self
    }

    pub async fn reconcile(&self, date: NaiveDate) -> ReconciliationReport {
        let mut report = ReconciliationReport::new(date);

        for pair in &self.pairs {
            self.check_pair(pair, date, &mut report).await;
        }

        let ctx = CheckContext {
            date,
            expected: self.expected.as_ref(),
            phases: self.phases.as_ref(),
            thresholds: self.thresholds,
        };
        for check in &self.cross_checks {
            match check.run(&ctx).await {
                Ok(Some(result)) => report.push_gap(result),
                Ok(None) => {}
                Err(e) => {
                    warn!(check = check.name(), error = %e, "Cross check skipped");
                    report.push_skip(format!("{}: {e}", check.name()));
                }
            }
        }

        info!(
            report_date = %date,
            gaps_found = report.gaps_found,
            skipped = report.skipped.len(),
            "Reconciliation cycle finished"
        );
        self.bus
            .publish(ReconciliationCompleted {
                report_date: date,
                gaps_found: report.gaps_found,
                timestamp: Utc::now(),
            })
            .await;

        report
    }

    async fn check_pair(&self, pair: &PhasePair, date: NaiveDate, report: &mut ReconciliationReport) {
        let expected = if pair.upstream == self.source_phase {
            self.expected.expected_units(date).await
        } else {
            self.phases.phase_count(&pair.upstream, date).await
        };

        let expected = match expected {
            Ok(Some(count)) => count,
            Ok(None) => {
                report.push_skip(format!("{pair}: no upstream count for {date}"));
                return;
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "Upstream count unavailable");
                report.push_skip(format!("{pair}: {e}"));
                return;
            }
        };

        let actual = match self.phases.phase_count(&pair.downstream, date).await {
            // A missing downstream phase counts as zero rows: the phase
            // simply never received anything for this date.
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                warn!(pair = %pair, error = %e, "Downstream count unavailable");
                report.push_skip(format!("{pair}: {e}"));
                return;
            }
        };

        if let Some(severity) = self.thresholds.grade(expected, actual) {
            report.push_gap(CheckResult {
                phase_pair: pair.to_string(),
                expected_count: expected,
                actual_count: actual,
                severity,
                message: format!(
                    "{} of {expected} expected rows missing in '{}'",
                    expected - actual,
                    pair.downstream
                ),
            });
        }
    }
}
