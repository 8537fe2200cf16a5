//! Coded concepts used in the dose report content tree.

use super::CodedConcept;
use once_cell::sync::Lazy;

/// X-Ray Radiation Dose SR Storage
pub const XRAY_DOSE_SR_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.88.67";

/// Template identifier for the projection X-ray dose report
pub const DOSE_REPORT_TEMPLATE: &str = "10001";

pub static XRAY_DOSE_REPORT: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113701", "X-Ray Radiation Dose Report"));
pub static LANGUAGE_OF_CONTENT: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("121049", "Language of Content Item and Descendants"));
pub static ACCUMULATED_DOSE_DATA: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113702", "Accumulated X-Ray Dose Data"));
pub static DAP_TOTAL: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113722", "Dose Area Product Total"));
pub static TOTAL_RADIOGRAPHIC_FRAMES: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113731", "Total Number of Radiographic Frames"));
pub static IRRADIATION_EVENT: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113706", "Irradiation Event X-Ray Data"));
pub static IRRADIATION_EVENT_UID: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113769", "Irradiation Event UID"));
pub static DATETIME_STARTED: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("111526", "DateTime Started"));
pub static KVP: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::dcm("113733", "KVP"));
pub static EXPOSURE: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::dcm("113736", "Exposure"));
pub static DOSE_AREA_PRODUCT: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("122130", "Dose Area Product"));
pub static SOURCE_OF_DOSE_INFORMATION: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113854", "Source of Dose Information"));
pub static AUTOMATED_DATA_COLLECTION: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113856", "Automated Data Collection"));
pub static COMPUTED_FROM_IMAGE_ATTRIBUTES: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113867", "Computed From Image Attributes"));
pub static DISTANCE_SOURCE_TO_DETECTOR: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113750", "Distance Source to Detector"));
pub static COLLIMATED_FIELD_HEIGHT: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113788", "Collimated Field Height"));
pub static COLLIMATED_FIELD_WIDTH: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113789", "Collimated Field Width"));
pub static XRAY_FILTERS: Lazy<CodedConcept> =
    Lazy::new(|| CodedConcept::dcm("113771", "X-Ray Filters"));

// Units (UCUM)
pub static UNIT_MGY_CM2: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::ucum("mGy.cm2", "mGy·cm²"));
pub static UNIT_KV: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::ucum("kV", "kV"));
pub static UNIT_UAS: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::ucum("uA.s", "µAs"));
pub static UNIT_MM: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::ucum("mm", "mm"));
pub static UNIT_FRAMES: Lazy<CodedConcept> = Lazy::new(|| CodedConcept::ucum("{frames}", "frames"));

/// Language code concept for a BCP 47 tag
pub fn language(tag: &str) -> CodedConcept {
    CodedConcept {
        value: tag.to_string(),
        scheme: "RFC5646".into(),
        meaning: tag.to_string(),
    }
}
