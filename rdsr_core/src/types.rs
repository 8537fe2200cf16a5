//! Core domain types for the dose capture pipeline.
//!
//! This module defines the values that flow between components:
//! - Exposure parameters and detector geometry from the acquisition side
//! - Dose calculation results and the persisted dose record
//! - Study identity and the derived study summary
//!
//! Dose values are in Gy·cm² throughout. Field dimensions are in mm and the
//! source-to-image distance is in cm, as delivered by the detector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Study identity
// ============================================================================

/// Identity of an open study. Totals are never merged across distinct keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StudyKey {
    pub study_id: String,
    pub patient_id: String,
}

impl StudyKey {
    pub fn new(study_id: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            patient_id: patient_id.into(),
        }
    }
}

impl fmt::Display for StudyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.study_id, self.patient_id)
    }
}

/// Study and patient identity captured when a study is opened
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StudyInfo {
    pub study_id: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub accession_number: Option<String>,
    pub modality: String,
    pub exam_type: String,
}

impl StudyInfo {
    pub fn key(&self) -> StudyKey {
        StudyKey::new(&self.study_id, &self.patient_id)
    }
}

// ============================================================================
// Acquisition inputs
// ============================================================================

/// The mAs value as received from the generator.
///
/// `NotReceived` is the explicit absence marker written to the ledger when the
/// reading did not arrive within the acquisition timeout.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MasReading {
    Received { value: f64 },
    NotReceived,
}

impl MasReading {
    pub fn value(&self) -> Option<f64> {
        match self {
            MasReading::Received { value } => Some(*value),
            MasReading::NotReceived => None,
        }
    }

    pub fn is_received(&self) -> bool {
        matches!(self, MasReading::Received { .. })
    }
}

impl From<Option<f64>> for MasReading {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(value) => MasReading::Received { value },
            None => MasReading::NotReceived,
        }
    }
}

/// Generator parameters for one exposure
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExposureParameters {
    pub kvp: f64,
    pub mas: MasReading,
    pub filter: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Detector geometry for one exposure
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectorGeometry {
    pub sid_cm: f64,
    pub field_width_mm: f64,
    pub field_height_mm: f64,
}

impl DetectorGeometry {
    /// Field area in cm²
    pub fn field_area_cm2(&self) -> f64 {
        (self.field_width_mm / 10.0) * (self.field_height_mm / 10.0)
    }
}

// ============================================================================
// Dose values
// ============================================================================

/// Where the effective dose value came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseSource {
    Calculated,
    Measured,
}

/// Result of a dose calculation.
///
/// The calculated value is kept even when a measured value takes precedence.
/// It is `None` only when the mAs reading was not received.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DapResult {
    pub calculated_dap: Option<f64>,
    pub measured_dap: Option<f64>,
    pub source: DoseSource,
}

impl DapResult {
    pub fn effective_dap(&self) -> Option<f64> {
        effective_dap(self.source, self.calculated_dap, self.measured_dap)
    }
}

fn effective_dap(source: DoseSource, calculated: Option<f64>, measured: Option<f64>) -> Option<f64> {
    match (source, measured) {
        (DoseSource::Measured, Some(measured)) => Some(measured),
        _ => calculated,
    }
}

/// One persisted exposure. Immutable once written to the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseRecord {
    pub exposure_id: Uuid,
    pub study_id: String,
    pub patient_id: String,
    pub device_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub kvp: f64,
    pub mas: MasReading,
    pub filter: String,
    pub sid_cm: f64,
    pub field_width_mm: f64,
    pub field_height_mm: f64,
    pub calculated_dap: Option<f64>,
    pub measured_dap: Option<f64>,
    pub dose_source: DoseSource,
    pub threshold_exceeded: bool,
}

impl DoseRecord {
    /// Assemble a record for an exposure taken while `key` was open
    pub fn new(
        exposure_id: Uuid,
        key: &StudyKey,
        device_id: &str,
        params: &ExposureParameters,
        geometry: &DetectorGeometry,
        dose: &DapResult,
        threshold_exceeded: bool,
    ) -> Self {
        Self {
            exposure_id,
            study_id: key.study_id.clone(),
            patient_id: key.patient_id.clone(),
            device_id: device_id.to_string(),
            timestamp: params.timestamp,
            kvp: params.kvp,
            mas: params.mas,
            filter: params.filter.clone(),
            sid_cm: geometry.sid_cm,
            field_width_mm: geometry.field_width_mm,
            field_height_mm: geometry.field_height_mm,
            calculated_dap: dose.calculated_dap,
            measured_dap: dose.measured_dap,
            dose_source: dose.source,
            threshold_exceeded,
        }
    }

    pub fn key(&self) -> StudyKey {
        StudyKey::new(&self.study_id, &self.patient_id)
    }

    /// Measured value if present and selected, otherwise the calculated value
    pub fn effective_dap(&self) -> Option<f64> {
        effective_dap(self.dose_source, self.calculated_dap, self.measured_dap)
    }
}

/// An exposure taken while no study was open on the device.
///
/// Held exposures carry no study or patient reference until an explicit
/// association turns them into dose records.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeldExposure {
    pub exposure_id: Uuid,
    pub device_id: String,
    pub params: ExposureParameters,
    pub geometry: DetectorGeometry,
    pub dose: DapResult,
}

impl HeldExposure {
    pub fn into_record(self, key: &StudyKey, threshold_exceeded: bool) -> DoseRecord {
        DoseRecord::new(
            self.exposure_id,
            key,
            &self.device_id,
            &self.params,
            &self.geometry,
            &self.dose,
            threshold_exceeded,
        )
    }
}

// ============================================================================
// Study summary
// ============================================================================

/// Per-study totals, always derived from ledger records
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StudySummary {
    pub study_id: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub accession_number: Option<String>,
    pub modality: String,
    pub exam_type: String,
    pub total_dap: f64,
    pub exposure_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
    pub threshold_exceeded: bool,
}

impl StudySummary {
    /// Recompute the summary for `info` from the study's ledger records.
    ///
    /// Records belonging to another study or patient are ignored.
    pub fn from_records(info: &StudyInfo, records: &[DoseRecord]) -> Self {
        let key = info.key();
        let own: Vec<&DoseRecord> = records.iter().filter(|r| r.key() == key).collect();

        let total_dap = own.iter().filter_map(|r| r.effective_dap()).sum();
        let started_at = own.iter().map(|r| r.timestamp).min();
        let ended_at = own.iter().map(|r| r.timestamp).max();

        Self {
            study_id: info.study_id.clone(),
            patient_id: info.patient_id.clone(),
            patient_name: info.patient_name.clone(),
            patient_birth_date: info.patient_birth_date.clone(),
            patient_sex: info.patient_sex.clone(),
            accession_number: info.accession_number.clone(),
            modality: info.modality.clone(),
            exam_type: info.exam_type.clone(),
            total_dap,
            exposure_count: own.len() as u32,
            started_at,
            ended_at,
            threshold_exceeded: own.iter().any(|r| r.threshold_exceeded),
        }
    }
}
