//! Running dose totals per open study.
//!
//! Totals are keyed by (study id, patient id). There is no operation that
//! combines totals of two keys. Exposures taken while no study is open are
//! kept in a holding buffer keyed by timestamp and device until they are
//! explicitly associated with a study.

use crate::{DoseRecord, Error, HeldExposure, Result, StudyInfo, StudyKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Running totals for one open study
#[derive(Clone, Debug, PartialEq)]
pub struct StudyTotals {
    pub info: StudyInfo,
    pub total_dap: f64,
    pub exposure_count: u32,
    pub threshold_exceeded: bool,
    pub opened_at: DateTime<Utc>,
    pub last_exposure_at: Option<DateTime<Utc>>,
}

type HoldKey = (DateTime<Utc>, String, Uuid);

#[derive(Debug, Default)]
pub struct StudyAccumulator {
    open: HashMap<StudyKey, StudyTotals>,
    held: BTreeMap<HoldKey, HeldExposure>,
}

impl StudyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accumulating for a study.
    ///
    /// A study id that is already open under a different patient is refused.
    pub fn open_study(&mut self, info: StudyInfo, now: DateTime<Utc>) -> Result<()> {
        let key = info.key();
        if self.open.contains_key(&key) {
            return Err(Error::Study(format!("study {} is already open", key)));
        }
        if let Some(other) = self.open.keys().find(|k| k.study_id == key.study_id) {
            return Err(Error::Study(format!(
                "study {} is open for a different patient ({})",
                key.study_id, other.patient_id
            )));
        }

        tracing::info!("Opened study {}", key);
        self.open.insert(
            key,
            StudyTotals {
                info,
                total_dap: 0.0,
                exposure_count: 0,
                threshold_exceeded: false,
                opened_at: now,
                last_exposure_at: None,
            },
        );
        Ok(())
    }

    pub fn is_open(&self, key: &StudyKey) -> bool {
        self.open.contains_key(key)
    }

    pub fn totals(&self, key: &StudyKey) -> Option<&StudyTotals> {
        self.open.get(key)
    }

    pub fn open_studies(&self) -> Vec<StudyKey> {
        let mut keys: Vec<StudyKey> = self.open.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Add a record to its own study's totals
    pub fn add_exposure(&mut self, record: &DoseRecord) -> Result<&StudyTotals> {
        let key = record.key();
        let totals = self
            .open
            .get_mut(&key)
            .ok_or_else(|| Error::Study(format!("study {} is not open", key)))?;

        match record.effective_dap() {
            Some(dap) => totals.total_dap += dap,
            None => tracing::warn!(
                "Exposure {} has no dose value; counted without dose",
                record.exposure_id
            ),
        }
        totals.exposure_count += 1;
        totals.threshold_exceeded |= record.threshold_exceeded;
        totals.last_exposure_at = Some(record.timestamp);
        Ok(totals)
    }

    /// Stop accumulating and hand back the final totals
    pub fn close_study(&mut self, key: &StudyKey) -> Option<StudyTotals> {
        let totals = self.open.remove(key);
        if totals.is_some() {
            tracing::info!("Closed study {}", key);
        }
        totals
    }

    /// Keep an exposure taken while no study was open
    pub fn hold(&mut self, held: HeldExposure) {
        let key = (held.params.timestamp, held.device_id.clone(), held.exposure_id);
        self.held.insert(key, held);
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn held(&self) -> impl Iterator<Item = &HeldExposure> {
        self.held.values()
    }

    /// Drain held exposures in timestamp order, optionally for one device only
    pub fn take_held(&mut self, device_id: Option<&str>) -> Vec<HeldExposure> {
        let keys: Vec<HoldKey> = self
            .held
            .keys()
            .filter(|(_, device, _)| device_id.map_or(true, |d| d == device))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.held.remove(&k))
            .collect()
    }
}
