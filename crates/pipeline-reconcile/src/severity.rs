use model::report::Severity;
use pipeline_core::settings::EngineSettings;

/// Gap grading: the missing fraction of the expected count decides the
/// severity. A missing fraction at or above `high_ratio` grades High, at
/// or above `medium_ratio` grades Medium, anything smaller Low.
#[derive(Debug, Clone, Copy)]
pub struct SeverityThresholds {
    pub medium_ratio: f64,
    pub high_ratio: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        SeverityThresholds {
            medium_ratio: 0.1,
            high_ratio: 0.5,
        }
    }
}

impl SeverityThresholds {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        SeverityThresholds {
            medium_ratio: settings.medium_gap_ratio,
            high_ratio: settings.high_gap_ratio,
        }
    }

    /// `None` when there is no gap. Actual counts above expected are not a
    /// gap; surpluses are the downstream phase's business.
    pub fn grade(&self, expected: u64, actual: u64) -> Option<Severity> {
        if expected == 0 || actual >= expected {
            return None;
        }

        let gap = (expected - actual) as f64;
        let ratio = gap / expected as f64;

        Some(if ratio >= self.high_ratio {
            Severity::High
        } else if ratio >= self.medium_ratio {
            Severity::Medium
        } else {
            Severity::Low
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_loss_grades_high() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(thresholds.grade(9, 0), Some(Severity::High));
    }

    #[test]
    fn full_count_is_no_gap() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(thresholds.grade(9, 9), None);
    }

    #[test]
    fn surplus_is_no_gap() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(thresholds.grade(9, 12), None);
    }

    #[test]
    fn small_and_medium_gaps_grade_by_ratio() {
        let thresholds = SeverityThresholds::default();
        // 5 of 100 missing: below the 10% medium line.
        assert_eq!(thresholds.grade(100, 95), Some(Severity::Low));
        // 20 of 100 missing: past medium, short of high.
        assert_eq!(thresholds.grade(100, 80), Some(Severity::Medium));
        // 60 of 100 missing: past the 50% high line.
        assert_eq!(thresholds.grade(100, 40), Some(Severity::High));
    }

    #[test]
    fn zero_expected_never_gaps() {
        let thresholds = SeverityThresholds::default();
        assert_eq!(thresholds.grade(0, 0), None);
    }
}
