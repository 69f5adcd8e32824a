//! ISO/IEC 14496-12 compliance tracking: each observed deviation is
//! classified as a warning or an error per the configured
//! [`crate::config::ComplianceLevel`], and accumulated into one verdict.

use crate::config::ComplianceLevel;
use crate::error::{Error, Result};

/// Overall compliance verdict for a parsed file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Compliant,
    Relaxed,
    NonCompliant,
}

/// Accumulates deviations observed while parsing one file.
#[derive(Debug, Default)]
pub(super) struct ComplianceTracker {
    level: Option<ComplianceLevel>,
    warnings: u32,
    errors: u32,
}

impl ComplianceTracker {
    pub(super) fn new(level: ComplianceLevel) -> Self {
        Self { level: Some(level), warnings: 0, errors: 0 }
    }

    /// Records a deviation. Under `Strict`, any deviation is an error and
    /// aborts parsing; under `Relaxed`, it is counted but parsing
    /// continues; under `Permissive`, it is not even counted.
    pub(super) fn observe(&mut self, description: &str) -> Result<()> {
        match self.level.unwrap_or(ComplianceLevel::Relaxed) {
            ComplianceLevel::Strict => {
                self.errors += 1;
                Err(Error::standard_violation(description.to_string()))
            }
            ComplianceLevel::Relaxed => {
                self.warnings += 1;
                Ok(())
            }
            ComplianceLevel::Permissive => Ok(()),
        }
    }

    pub(super) fn verdict(&self) -> Verdict {
        if self.errors > 0 {
            Verdict::NonCompliant
        } else if self.warnings > 0 {
            Verdict::Relaxed
        } else {
            Verdict::Compliant
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_errors_on_any_deviation() {
        let mut tracker = ComplianceTracker::new(ComplianceLevel::Strict);
        assert!(tracker.observe("reserved value used").is_err());
        assert_eq!(tracker.verdict(), Verdict::NonCompliant);
    }

    #[test]
    fn relaxed_mode_counts_without_failing() {
        let mut tracker = ComplianceTracker::new(ComplianceLevel::Relaxed);
        assert!(tracker.observe("reserved value used").is_ok());
        assert_eq!(tracker.verdict(), Verdict::Relaxed);
    }

    #[test]
    fn permissive_mode_ignores_deviations() {
        let mut tracker = ComplianceTracker::new(ComplianceLevel::Permissive);
        tracker.observe("reserved value used").unwrap();
        assert_eq!(tracker.verdict(), Verdict::Compliant);
    }

    #[test]
    fn no_deviations_is_compliant() {
        let tracker = ComplianceTracker::new(ComplianceLevel::Strict);
        assert_eq!(tracker.verdict(), Verdict::Compliant);
    }
}
