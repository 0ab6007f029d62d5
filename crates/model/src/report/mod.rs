use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Two adjacent pipeline phases compared by a reconciliation check,
/// e.g. raw storage → derived analytics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhasePair {
    pub upstream: String,
    pub downstream: String,
}

impl PhasePair {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

impl fmt::Display for PhasePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.upstream, self.downstream)
    }
}

/// One gap found by a reconciliation check. Checks that find no gap emit
/// nothing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub phase_pair: String,
    pub expected_count: u64,
    pub actual_count: u64,
    pub severity: Severity,
    pub message: String,
}

impl CheckResult {
    pub fn gap(&self) -> u64 {
        self.expected_count.saturating_sub(self.actual_count)
    }
}

/// Output of one reconciliation cycle for one date. Purely observational:
/// generating a report never mutates pipeline state.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub report_date: NaiveDate,
    pub checks: Vec<CheckResult>,
    /// Checks that could not run because collaborator data was missing.
    /// Informational, never an error.
    pub skipped: Vec<String>,
    pub gaps_found: usize,
}

impl ReconciliationReport {
    pub fn new(report_date: NaiveDate) -> Self {
        Self {
            report_date,
            checks: Vec::new(),
            skipped: Vec::new(),
            gaps_found: 0,
        }
    }

    pub fn push_gap(&mut self, check: CheckResult) {
        self.gaps_found += 1;
        self.checks.push(check);
    }

    pub fn push_skip(&mut self, message: impl Into<String>) {
        self.skipped.push(message.into());
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.checks.iter().map(|c| c.severity).max()
    }
}
