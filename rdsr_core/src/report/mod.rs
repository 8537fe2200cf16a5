//! Radiation dose structured report: content tree and builder.
//!
//! A report is a tree of coded content items. The root container holds the
//! language, one accumulated-dose container and one irradiation-event
//! container per exposure.

pub mod builder;
pub mod codes;

pub use builder::{DoseReportBuilder, ReportBuilder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A (code value, coding scheme, meaning) triple
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodedConcept {
    pub value: String,
    pub scheme: String,
    pub meaning: String,
}

impl CodedConcept {
    pub fn dcm(value: &str, meaning: &str) -> Self {
        Self {
            value: value.into(),
            scheme: "DCM".into(),
            meaning: meaning.into(),
        }
    }

    pub fn ucum(value: &str, meaning: &str) -> Self {
        Self {
            value: value.into(),
            scheme: "UCUM".into(),
            meaning: meaning.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    Contains,
    HasConceptMod,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "value_type", rename_all = "snake_case")]
pub enum ContentValue {
    Container { children: Vec<ContentItem> },
    Numeric { value: f64, unit: CodedConcept },
    Code { code: CodedConcept },
    Text { text: String },
    DateTime { value: DateTime<Utc> },
    Uid { uid: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    /// Relationship to the parent; the root has none
    pub relationship: Option<Relationship>,
    pub concept: CodedConcept,
    pub value: ContentValue,
}

impl ContentItem {
    pub fn children(&self) -> &[ContentItem] {
        match &self.value {
            ContentValue::Container { children } => children,
            _ => &[],
        }
    }

    /// First direct child with the given concept
    pub fn child(&self, concept: &CodedConcept) -> Option<&ContentItem> {
        self.children().iter().find(|c| &c.concept == concept)
    }

    pub fn numeric(&self) -> Option<f64> {
        match &self.value {
            ContentValue::Numeric { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// A complete dose report ready for export
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportDocument {
    /// Document type identifier presented to the transport
    pub sop_class_uid: String,
    pub template_id: String,
    pub document_id: Uuid,
    pub study_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub accession_number: Option<String>,
    pub modality: String,
    pub created_at: DateTime<Utc>,
    pub content: ContentItem,
}

impl ReportDocument {
    /// The accumulated-dose container
    pub fn accumulated(&self) -> Option<&ContentItem> {
        self.content.child(&codes::ACCUMULATED_DOSE_DATA)
    }

    /// Per-exposure containers in document order
    pub fn irradiation_events(&self) -> Vec<&ContentItem> {
        self.content
            .children()
            .iter()
            .filter(|c| c.concept == *codes::IRRADIATION_EVENT)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::types::fixtures::{record, study_info};
    use crate::StudySummary;

    pub fn sample_report(study_id: &str, patient_id: &str) -> ReportDocument {
        let info = study_info(study_id, patient_id);
        let records = vec![record(&info.key(), 0.5, 0), record(&info.key(), 0.25, 1)];
        DoseReportBuilder::default()
            .build(&StudySummary::from_records(&info, &records), &records)
            .unwrap()
    }
}
