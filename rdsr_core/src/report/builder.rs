//! Mapping of a study summary and its dose records into a report.
//!
//! All mandatory fields are checked before anything is assembled. A build
//! either returns a complete document or an error naming every missing
//! field; there is no partial result.

use super::codes;
use super::{CodedConcept, ContentItem, ContentValue, Relationship, ReportDocument};
use crate::error::ReportValidationError;
use crate::{DoseRecord, DoseSource, Result, StudySummary};
use chrono::Utc;
use uuid::Uuid;

/// Gy·cm² to mGy·cm²
const DAP_TO_REPORT_UNIT: f64 = 1000.0;
/// mAs to µAs
const MAS_TO_REPORT_UNIT: f64 = 1000.0;
const CM_TO_MM: f64 = 10.0;

/// Builds a report document for a closed study
pub trait ReportBuilder: Send + Sync {
    fn build(&self, summary: &StudySummary, exposures: &[DoseRecord]) -> Result<ReportDocument>;
}

#[derive(Clone, Debug)]
pub struct DoseReportBuilder {
    language: String,
}

impl DoseReportBuilder {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl Default for DoseReportBuilder {
    fn default() -> Self {
        Self::new("en-US")
    }
}

impl ReportBuilder for DoseReportBuilder {
    fn build(&self, summary: &StudySummary, exposures: &[DoseRecord]) -> Result<ReportDocument> {
        let missing = missing_fields(summary, exposures);
        if !missing.is_empty() {
            return Err(ReportValidationError { missing }.into());
        }

        let total_dap: f64 = exposures.iter().filter_map(|e| e.effective_dap()).sum();

        let mut children = vec![
            item(
                Relationship::HasConceptMod,
                &codes::LANGUAGE_OF_CONTENT,
                ContentValue::Code {
                    code: codes::language(&self.language),
                },
            ),
            container(
                &codes::ACCUMULATED_DOSE_DATA,
                vec![
                    numeric(&codes::DAP_TOTAL, total_dap * DAP_TO_REPORT_UNIT, &codes::UNIT_MGY_CM2),
                    numeric(
                        &codes::TOTAL_RADIOGRAPHIC_FRAMES,
                        exposures.len() as f64,
                        &codes::UNIT_FRAMES,
                    ),
                ],
            ),
        ];
        children.extend(exposures.iter().map(irradiation_event));

        let content = ContentItem {
            relationship: None,
            concept: codes::XRAY_DOSE_REPORT.clone(),
            value: ContentValue::Container { children },
        };

        tracing::debug!(
            "Built dose report for study {} with {} events",
            summary.study_id,
            exposures.len()
        );

        Ok(ReportDocument {
            sop_class_uid: codes::XRAY_DOSE_SR_SOP_CLASS.into(),
            template_id: codes::DOSE_REPORT_TEMPLATE.into(),
            document_id: Uuid::new_v4(),
            study_id: summary.study_id.clone(),
            patient_id: summary.patient_id.clone(),
            patient_name: summary.patient_name.clone().unwrap_or_default(),
            patient_birth_date: summary.patient_birth_date.clone(),
            patient_sex: summary.patient_sex.clone(),
            accession_number: summary.accession_number.clone(),
            modality: summary.modality.clone(),
            created_at: Utc::now(),
            content,
        })
    }
}

fn missing_fields(summary: &StudySummary, exposures: &[DoseRecord]) -> Vec<String> {
    let mut missing = Vec::new();

    if summary.study_id.trim().is_empty() {
        missing.push("study.study_id".to_string());
    }
    if summary.patient_id.trim().is_empty() {
        missing.push("study.patient_id".to_string());
    }
    if summary.patient_name.as_deref().map_or(true, |n| n.trim().is_empty()) {
        missing.push("study.patient_name".to_string());
    }
    if summary.modality.trim().is_empty() {
        missing.push("study.modality".to_string());
    }
    if summary.started_at.is_none() {
        missing.push("study.started_at".to_string());
    }
    if exposures.is_empty() {
        missing.push("study.exposures".to_string());
    } else if summary.exposure_count as usize != exposures.len() {
        missing.push(format!(
            "study.exposure_count (summary {}, records {})",
            summary.exposure_count,
            exposures.len()
        ));
    }

    for (i, exposure) in exposures.iter().enumerate() {
        let mut field = |name: &str| missing.push(format!("exposure[{}].{}", i, name));

        if exposure.exposure_id.is_nil() {
            field("exposure_id");
        }
        if exposure.study_id != summary.study_id || exposure.patient_id != summary.patient_id {
            field("study_reference");
        }
        if !is_positive(exposure.kvp) {
            field("kvp");
        }
        if !exposure.mas.is_received() {
            field("mas");
        }
        if exposure.effective_dap().is_none() {
            field("dap");
        }
        if !is_positive(exposure.sid_cm) {
            field("sid");
        }
        if !is_positive(exposure.field_width_mm) {
            field("field_width");
        }
        if !is_positive(exposure.field_height_mm) {
            field("field_height");
        }
    }

    missing
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn irradiation_event(exposure: &DoseRecord) -> ContentItem {
    let source = match exposure.dose_source {
        DoseSource::Measured => codes::AUTOMATED_DATA_COLLECTION.clone(),
        DoseSource::Calculated => codes::COMPUTED_FROM_IMAGE_ATTRIBUTES.clone(),
    };

    let mut children = vec![
        item(
            Relationship::Contains,
            &codes::IRRADIATION_EVENT_UID,
            ContentValue::Uid {
                uid: uuid_to_uid(exposure.exposure_id),
            },
        ),
        item(
            Relationship::Contains,
            &codes::DATETIME_STARTED,
            ContentValue::DateTime {
                value: exposure.timestamp,
            },
        ),
        numeric(&codes::KVP, exposure.kvp, &codes::UNIT_KV),
        numeric(
            &codes::EXPOSURE,
            exposure.mas.value().unwrap_or_default() * MAS_TO_REPORT_UNIT,
            &codes::UNIT_UAS,
        ),
        numeric(
            &codes::DOSE_AREA_PRODUCT,
            exposure.effective_dap().unwrap_or_default() * DAP_TO_REPORT_UNIT,
            &codes::UNIT_MGY_CM2,
        ),
        item(
            Relationship::Contains,
            &codes::SOURCE_OF_DOSE_INFORMATION,
            ContentValue::Code { code: source },
        ),
        numeric(
            &codes::DISTANCE_SOURCE_TO_DETECTOR,
            exposure.sid_cm * CM_TO_MM,
            &codes::UNIT_MM,
        ),
        numeric(&codes::COLLIMATED_FIELD_WIDTH, exposure.field_width_mm, &codes::UNIT_MM),
        numeric(&codes::COLLIMATED_FIELD_HEIGHT, exposure.field_height_mm, &codes::UNIT_MM),
    ];

    if !exposure.filter.trim().is_empty() {
        children.push(item(
            Relationship::Contains,
            &codes::XRAY_FILTERS,
            ContentValue::Text {
                text: exposure.filter.clone(),
            },
        ));
    }

    container(&codes::IRRADIATION_EVENT, children)
}

fn item(relationship: Relationship, concept: &CodedConcept, value: ContentValue) -> ContentItem {
    ContentItem {
        relationship: Some(relationship),
        concept: concept.clone(),
        value,
    }
}

fn container(concept: &CodedConcept, children: Vec<ContentItem>) -> ContentItem {
    item(Relationship::Contains, concept, ContentValue::Container { children })
}

fn numeric(concept: &CodedConcept, value: f64, unit: &CodedConcept) -> ContentItem {
    item(
        Relationship::Contains,
        concept,
        ContentValue::Numeric {
            value,
            unit: unit.clone(),
        },
    )
}

/// UUID-derived UID under the 2.25 root
fn uuid_to_uid(id: Uuid) -> String {
    format!("2.25.{}", id.as_u128())
}
