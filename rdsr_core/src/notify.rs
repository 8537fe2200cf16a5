//! Outward notifications: advisory dose alerts and operator notices.

use crate::threshold::ThresholdAlert;
use uuid::Uuid;

/// An export item that exhausted its retry budget
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorNotice {
    pub item_id: Uuid,
    pub study_id: String,
    pub destination: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Receives notifications meant for people. Implementations must return
/// quickly; the pipeline calls them inline.
pub trait Notifier: Send + Sync {
    fn threshold_exceeded(&self, alert: &ThresholdAlert);

    fn export_failed(&self, notice: &OperatorNotice);
}

/// Notifier that writes to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn threshold_exceeded(&self, alert: &ThresholdAlert) {
        tracing::warn!(
            "Advisory: {} dose {:.3} Gy·cm² above reference level {:.3} for {} (study {})",
            match alert.basis {
                crate::threshold::ThresholdBasis::Cumulative => "cumulative",
                crate::threshold::ThresholdBasis::PerExposure => "exposure",
            },
            alert.observed,
            alert.reference_level,
            alert.exam_type,
            alert.study
        );
    }

    fn export_failed(&self, notice: &OperatorNotice) {
        tracing::error!(
            "Operator action required: report for study {} to {} failed after {} attempts ({})",
            notice.study_id,
            notice.destination,
            notice.attempts,
            notice.last_error.as_deref().unwrap_or("no error recorded")
        );
    }
}
