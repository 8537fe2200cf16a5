//! Dose Area Product calculation.
//!
//! ```text
//! K_air = k_factor * kVp^n * mAs / SID² * C_cal
//! DAP   = K_air * (width_cm * height_cm)
//! ```
//!
//! A measured DAP reading, when supplied, becomes the effective value. The
//! calculated value is still computed and kept for the audit trail.

use crate::calibration::{CalibrationCoefficients, CalibrationStore};
use crate::{DapResult, DetectorGeometry, DoseSource, Error, ExposureParameters, MasReading, Result};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Capability to turn acquisition inputs into a dose value
pub trait DoseCalculator: Send + Sync {
    fn calculate(
        &self,
        params: &ExposureParameters,
        geometry: &DetectorGeometry,
        measured_dap: Option<f64>,
    ) -> Result<DapResult>;
}

/// Calculator reading the active snapshot of a [`CalibrationStore`]
pub struct DapCalculator {
    calibration: Arc<CalibrationStore>,
}

impl DapCalculator {
    pub fn new(calibration: Arc<CalibrationStore>) -> Self {
        Self { calibration }
    }
}

impl DoseCalculator for DapCalculator {
    fn calculate(
        &self,
        params: &ExposureParameters,
        geometry: &DetectorGeometry,
        measured_dap: Option<f64>,
    ) -> Result<DapResult> {
        let coefficients = self.calibration.snapshot();
        calculate_dap(params, geometry, &coefficients, measured_dap)
    }
}

/// Compute the dose for one exposure against a fixed coefficient set
pub fn calculate_dap(
    params: &ExposureParameters,
    geometry: &DetectorGeometry,
    coefficients: &CalibrationCoefficients,
    measured_dap: Option<f64>,
) -> Result<DapResult> {
    require_positive("kVp", params.kvp)?;
    require_positive("SID", geometry.sid_cm)?;
    require_positive("field width", geometry.field_width_mm)?;
    require_positive("field height", geometry.field_height_mm)?;

    let calculated_dap = match params.mas {
        MasReading::Received { value } => {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidExposure(format!("mAs must be non-negative, got {}", value)));
            }
            let k_air = coefficients.k_factor * params.kvp.powf(coefficients.exponent) * value
                / geometry.sid_cm.powi(2)
                * coefficients.calibration_constant;
            Some(k_air * geometry.field_area_cm2())
        }
        MasReading::NotReceived => {
            tracing::warn!("mAs not received, calculated DAP unavailable for this exposure");
            None
        }
    };

    let measured_dap = match measured_dap {
        Some(value) if value.is_finite() && value >= 0.0 => Some(value),
        Some(value) => {
            tracing::warn!("Ignoring invalid measured DAP reading {}", value);
            None
        }
        None => None,
    };

    let source = if measured_dap.is_some() {
        DoseSource::Measured
    } else {
        DoseSource::Calculated
    };

    Ok(DapResult {
        calculated_dap,
        measured_dap,
        source,
    })
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidExposure(format!("{} must be positive, got {}", name, value)))
    }
}

/// Wait up to `timeout` for the generator to report mAs.
///
/// A timeout or a closed source yields the absence marker, never an error.
pub fn await_mas(source: &Receiver<f64>, timeout: Duration) -> MasReading {
    match source.recv_timeout(timeout) {
        Ok(value) => MasReading::Received { value },
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("mAs not received within {:?}", timeout);
            MasReading::NotReceived
        }
        Err(RecvTimeoutError::Disconnected) => {
            tracing::warn!("mAs source disconnected before a reading arrived");
            MasReading::NotReceived
        }
    }
}
