//! Advisory comparison against per-exam reference levels.
//!
//! The advisor only reports. It never delays, blocks or cancels an exposure,
//! and an exam type without a configured level is not compared at all.

use crate::StudyKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What the reference level is compared against
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdBasis {
    #[default]
    Cumulative,
    PerExposure,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferenceLevel {
    /// DAP in Gy·cm²
    pub dap: f64,
    #[serde(default)]
    pub basis: ThresholdBasis,
}

/// Reference levels by exam type
pub type ReferenceLevels = BTreeMap<String, ReferenceLevel>;

/// Result of a comparison that was actually performed
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Assessment {
    pub basis: ThresholdBasis,
    pub reference_level: f64,
    pub observed: f64,
    /// The observed value is above the reference level
    pub exceeded: bool,
    /// This exposure is the one that crossed the level
    pub raise_alert: bool,
}

/// Advisory notification for an exceeded reference level
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdAlert {
    pub study: StudyKey,
    pub exam_type: String,
    pub exposure_id: Uuid,
    pub basis: ThresholdBasis,
    pub reference_level: f64,
    pub observed: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ThresholdAdvisor {
    levels: ReferenceLevels,
}

impl ThresholdAdvisor {
    pub fn new(levels: ReferenceLevels) -> Self {
        Self { levels }
    }

    pub fn level_for(&self, exam_type: &str) -> Option<&ReferenceLevel> {
        self.levels.get(exam_type)
    }

    /// Compare one exposure against the level for `exam_type`.
    ///
    /// For a cumulative level the alert is raised only by the exposure that
    /// takes the running total from at-or-below the level to above it.
    /// Returns `None` when no level is configured.
    pub fn check(
        &self,
        exam_type: &str,
        cumulative_before: f64,
        exposure_dap: Option<f64>,
    ) -> Option<Assessment> {
        let level = self.level_for(exam_type)?;
        let dap = exposure_dap.unwrap_or(0.0);

        let assessment = match level.basis {
            ThresholdBasis::Cumulative => {
                let after = cumulative_before + dap;
                let exceeded = after > level.dap;
                Assessment {
                    basis: level.basis,
                    reference_level: level.dap,
                    observed: after,
                    exceeded,
                    raise_alert: exceeded && cumulative_before <= level.dap,
                }
            }
            ThresholdBasis::PerExposure => {
                let exceeded = dap > level.dap;
                Assessment {
                    basis: level.basis,
                    reference_level: level.dap,
                    observed: dap,
                    exceeded,
                    raise_alert: exceeded,
                }
            }
        };
        Some(assessment)
    }
}

impl Assessment {
    pub fn alert(&self, study: &StudyKey, exam_type: &str, exposure_id: Uuid) -> ThresholdAlert {
        ThresholdAlert {
            study: study.clone(),
            exam_type: exam_type.to_string(),
            exposure_id,
            basis: self.basis,
            reference_level: self.reference_level,
            observed: self.observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisor() -> ThresholdAdvisor {
        let mut levels = ReferenceLevels::new();
        levels.insert(
            "chest_pa".into(),
            ReferenceLevel {
                dap: 2.00,
                basis: ThresholdBasis::Cumulative,
            },
        );
        levels.insert(
            "skull".into(),
            ReferenceLevel {
                dap: 0.80,
                basis: ThresholdBasis::PerExposure,
            },
        );
        ThresholdAdvisor::new(levels)
    }

    #[test]
    fn test_crossing_raises_single_alert() {
        let advisor = advisor();
        let crossing = advisor.check("chest_pa", 1.90, Some(0.15)).unwrap();
        assert!(crossing.exceeded);
        assert!(crossing.raise_alert);
        assert!((crossing.observed - 2.05).abs() < 1e-9);

        // Already above: still flagged, no repeated alert
        let after = advisor.check("chest_pa", 2.05, Some(0.10)).unwrap();
        assert!(after.exceeded);
        assert!(!after.raise_alert);
    }

    #[test]
    fn test_below_level() {
        let assessment = advisor().check("chest_pa", 1.0, Some(0.5)).unwrap();
        assert!(!assessment.exceeded);
        assert!(!assessment.raise_alert);
    }

    #[test]
    fn test_exactly_at_level_is_not_exceeded() {
        let assessment = advisor().check("chest_pa", 1.5, Some(0.5)).unwrap();
        assert!(!assessment.exceeded);
    }

    #[test]
    fn test_unconfigured_exam_type_is_silent() {
        assert!(advisor().check("pelvis_ap", 100.0, Some(50.0)).is_none());
    }

    #[test]
    fn test_per_exposure_basis() {
        let advisor = advisor();
        assert!(advisor.check("skull", 10.0, Some(0.5)).map(|a| !a.exceeded).unwrap());
        let high = advisor.check("skull", 0.0, Some(0.9)).unwrap();
        assert!(high.exceeded && high.raise_alert);
    }
}
