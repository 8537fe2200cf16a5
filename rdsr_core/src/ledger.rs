//! Dose ledger: one durable file per exposure.
//!
//! Layout under the ledger root:
//!
//! ```text
//! records/<exposure_id>.json       promoted dose records (immutable)
//! held/<exposure_id>.json          exposures taken while no study was open
//! studies/<hex(study_id)>.json    study identity captured at study open
//! ```
//!
//! Writes go through [`crate::storage`]: temporary artifact, sync, rename.
//! A per-root lock serializes writers; readers only ever see promoted files.

use crate::storage::{self, DirLock, RecoveryReport};
use crate::{DoseRecord, Error, HeldExposure, Result, StudyInfo, StudyKey};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Durable storage used by the pipeline for dose data
pub trait DoseStore: Send + Sync {
    /// Durably write a record; returns only after promotion succeeded
    fn persist(&self, record: &DoseRecord) -> Result<()>;

    /// Records of one study in chronological order
    fn study_records(&self, key: &StudyKey) -> Result<Vec<DoseRecord>>;

    fn persist_held(&self, held: &HeldExposure) -> Result<()>;

    fn held_exposures(&self) -> Result<Vec<HeldExposure>>;

    /// Drop a held exposure once its dose record has been persisted
    fn release_held(&self, exposure_id: Uuid) -> Result<()>;

    fn save_study(&self, info: &StudyInfo) -> Result<()>;

    fn study_info(&self, study_id: &str) -> Result<Option<StudyInfo>>;
}

/// File-per-record dose ledger
pub struct DoseLedger {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DoseLedger {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let ledger = Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        };
        for dir in [ledger.records_dir(), ledger.held_dir(), ledger.studies_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(ledger)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn held_dir(&self) -> PathBuf {
        self.root.join("held")
    }

    pub fn studies_dir(&self) -> PathBuf {
        self.root.join("studies")
    }

    fn record_path(&self, exposure_id: Uuid) -> PathBuf {
        self.records_dir().join(format!("{}.json", exposure_id))
    }

    fn held_path(&self, exposure_id: Uuid) -> PathBuf {
        self.held_dir().join(format!("{}.json", exposure_id))
    }

    /// Study ids are free text; the hex form keeps distinct ids distinct
    fn study_path(&self, study_id: &str) -> PathBuf {
        self.studies_dir().join(format!("{}.json", hex::encode(study_id.as_bytes())))
    }

    /// Resolve every orphaned temporary artifact left by an interrupted write.
    ///
    /// Complete artifacts are promoted, anything that does not parse is
    /// deleted. Held exposures that already have a final record are removed.
    /// No `.tmp` file survives this call.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _dir_lock = DirLock::acquire(&self.root)?;

        let mut report = RecoveryReport::default();
        report.merge(storage::recover_temp_artifacts::<DoseRecord>(&self.records_dir(), |r| {
            self.record_path(r.exposure_id)
        })?);
        report.merge(storage::recover_temp_artifacts::<HeldExposure>(&self.held_dir(), |h| {
            self.held_path(h.exposure_id)
        })?);
        report.merge(storage::recover_temp_artifacts::<StudyInfo>(&self.studies_dir(), |s| {
            self.study_path(&s.study_id)
        })?);

        for held_path in storage::list_json(&self.held_dir())? {
            let held: HeldExposure = match storage::read_json(&held_path) {
                Ok(held) => held,
                Err(e) => {
                    tracing::warn!("Unreadable held exposure {:?}: {}", held_path, e);
                    continue;
                }
            };
            if self.record_path(held.exposure_id).exists() {
                std::fs::remove_file(&held_path)?;
                report.discarded += 1;
                tracing::info!(
                    "Removed held exposure {} already associated with a study",
                    held.exposure_id
                );
            }
        }

        tracing::info!(
            "Ledger recovery: {} promoted, {} discarded",
            report.promoted,
            report.discarded
        );
        Ok(report)
    }

    /// Load one record by exposure id
    pub fn load(&self, exposure_id: Uuid) -> Result<Option<DoseRecord>> {
        let path = self.record_path(exposure_id);
        if !path.exists() {
            return Ok(None);
        }
        read_final(&path).map(Some)
    }

    /// Every promoted record, ordered by timestamp
    pub fn records(&self) -> Result<Vec<DoseRecord>> {
        let mut records: Vec<DoseRecord> = read_all(&self.records_dir())?;
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.exposure_id.cmp(&b.exposure_id))
        });
        Ok(records)
    }

    /// Write all records to a CSV file, returning the row count
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let records = self.records()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let temp = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut writer = csv::Writer::from_writer(temp.as_file());
            for record in &records {
                writer.serialize(CsvRow::from(record))?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::info!("Exported {} dose records to {:?}", records.len(), path);
        Ok(records.len())
    }

    fn write_exclusive<T: serde::Serialize>(&self, final_path: &Path, value: &T, replace: bool) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _dir_lock = DirLock::acquire(&self.root)?;
        storage::atomic_write_json(final_path, value, replace)
    }
}

impl DoseStore for DoseLedger {
    fn persist(&self, record: &DoseRecord) -> Result<()> {
        let path = self.record_path(record.exposure_id);
        if path.exists() {
            return Err(Error::Persistence(format!(
                "dose record {} already exists",
                record.exposure_id
            )));
        }
        self.write_exclusive(&path, record, false)?;
        tracing::debug!("Persisted dose record {}", record.exposure_id);
        Ok(())
    }

    fn study_records(&self, key: &StudyKey) -> Result<Vec<DoseRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.study_id == key.study_id && r.patient_id == key.patient_id)
            .collect())
    }

    fn persist_held(&self, held: &HeldExposure) -> Result<()> {
        self.write_exclusive(&self.held_path(held.exposure_id), held, false)?;
        tracing::debug!("Persisted held exposure {}", held.exposure_id);
        Ok(())
    }

    fn held_exposures(&self) -> Result<Vec<HeldExposure>> {
        let mut held: Vec<HeldExposure> = read_all(&self.held_dir())?;
        held.sort_by_key(|h| h.params.timestamp);
        Ok(held)
    }

    fn release_held(&self, exposure_id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _dir_lock = DirLock::acquire(&self.root)?;
        let path = self.held_path(exposure_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn save_study(&self, info: &StudyInfo) -> Result<()> {
        self.write_exclusive(&self.study_path(&info.study_id), info, true)
    }

    fn study_info(&self, study_id: &str) -> Result<Option<StudyInfo>> {
        let path = self.study_path(study_id);
        if !path.exists() {
            return Ok(None);
        }
        let info: StudyInfo = read_final(&path)?;
        if info.study_id != study_id {
            return Err(Error::Persistence(format!(
                "study file {:?} holds study {}, expected {}",
                path, info.study_id, study_id
            )));
        }
        Ok(Some(info))
    }
}

/// Every promoted artifact in `dir`.
///
/// A final artifact that does not parse is an error, never a gap.
fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    storage::list_json(dir)?
        .iter()
        .map(|path| read_final(path))
        .collect()
}

fn read_final<T: DeserializeOwned>(path: &Path) -> Result<T> {
    storage::read_json(path).map_err(|e| {
        tracing::error!("Unreadable ledger artifact {:?}: {}", path, e);
        Error::Persistence(format!("unreadable ledger artifact {:?}: {}", path, e))
    })
}

/// A row in the CSV export
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    exposure_id: String,
    study_id: String,
    patient_id: String,
    device_id: String,
    timestamp: String,
    kvp: f64,
    mas: Option<f64>,
    filter: String,
    sid_cm: f64,
    field_width_mm: f64,
    field_height_mm: f64,
    calculated_dap: Option<f64>,
    measured_dap: Option<f64>,
    dose_source: String,
    effective_dap: Option<f64>,
    threshold_exceeded: bool,
}

impl From<&DoseRecord> for CsvRow {
    fn from(record: &DoseRecord) -> Self {
        CsvRow {
            exposure_id: record.exposure_id.to_string(),
            study_id: record.study_id.clone(),
            patient_id: record.patient_id.clone(),
            device_id: record.device_id.clone(),
            timestamp: record.timestamp.to_rfc3339(),
            kvp: record.kvp,
            mas: record.mas.value(),
            filter: record.filter.clone(),
            sid_cm: record.sid_cm,
            field_width_mm: record.field_width_mm,
            field_height_mm: record.field_height_mm,
            calculated_dap: record.calculated_dap,
            measured_dap: record.measured_dap,
            dose_source: format!("{:?}", record.dose_source).to_lowercase(),
            effective_dap: record.effective_dap(),
            threshold_exceeded: record.threshold_exceeded,
        }
    }
}
