//! Pipeline orchestrator.
//!
//! One worker thread drains a channel of [`PipelineEvent`]s and sequences
//! calculation, persistence, audit, accumulation and threshold checks for
//! each exposure, and report build plus export hand-off for each closed
//! study. Producers only ever touch [`Pipeline::submit`], which never waits
//! on the worker.
//!
//! Every collaborator is passed in through [`PipelineComponents`].

use crate::accumulator::StudyAccumulator;
use crate::audit::{AuditEvent, AuditEventType, AuditTrail, Outcome, Severity};
use crate::calibration::CalibrationStore;
use crate::dap::DoseCalculator;
use crate::events::{Broadcast, DoseUpdate, StudyClosed};
use crate::export_queue::{Dispatcher, ExportSink};
use crate::ledger::DoseStore;
use crate::notify::Notifier;
use crate::report::ReportBuilder;
use crate::threshold::ThresholdAdvisor;
use crate::{
    DetectorGeometry, DoseRecord, Error, ExposureParameters, HeldExposure, Result, StudyInfo,
    StudyKey, StudySummary,
};
use chrono::Utc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// One exposure as delivered by the acquisition path
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureEvent {
    /// Assigned by the pipeline when absent
    pub exposure_id: Option<Uuid>,
    pub device_id: String,
    /// Study open on the device, if any
    pub study: Option<StudyKey>,
    pub params: ExposureParameters,
    pub geometry: DetectorGeometry,
    /// Reading from a DAP meter, when the device has one
    pub measured_dap: Option<f64>,
}

#[derive(Debug)]
pub enum PipelineEvent {
    OpenStudy(StudyInfo),
    Exposure(ExposureEvent),
    /// Move held exposures into an open study, optionally from one device only
    AssociateHeld {
        study: StudyKey,
        device_id: Option<String>,
    },
    CloseStudy(StudyKey),
    ReloadCalibration,
    /// Acknowledged once every earlier event has been handled
    Flush(Sender<()>),
    Shutdown,
}

/// Capabilities the worker is built from
pub struct PipelineComponents {
    pub calculator: Arc<dyn DoseCalculator>,
    pub store: Arc<dyn DoseStore>,
    pub audit: Arc<AuditTrail>,
    pub advisor: ThresholdAdvisor,
    pub builder: Arc<dyn ReportBuilder>,
    pub export: Arc<dyn ExportSink>,
    pub notifier: Arc<dyn Notifier>,
    /// Target of `ReloadCalibration`; reload requests are ignored without one
    pub calibration: Option<Arc<CalibrationStore>>,
    /// Export destination for finished reports
    pub destination: String,
}

/// Read-side contract for report consumers.
///
/// Answers come from the ledger, so they are the same whether or not a
/// study-closed broadcast was received.
#[derive(Clone)]
pub struct StudyQueries {
    store: Arc<dyn DoseStore>,
}

impl StudyQueries {
    pub fn new(store: Arc<dyn DoseStore>) -> Self {
        Self { store }
    }

    /// Summary recomputed from the study's ledger records
    pub fn get_study_summary(&self, study_id: &str) -> Result<Option<StudySummary>> {
        let Some(info) = self.store.study_info(study_id)? else {
            return Ok(None);
        };
        let records = self.store.study_records(&info.key())?;
        Ok(Some(StudySummary::from_records(&info, &records)))
    }

    /// Records of the study in chronological order
    pub fn get_study_exposures(&self, study_id: &str) -> Result<Vec<DoseRecord>> {
        match self.store.study_info(study_id)? {
            Some(info) => self.store.study_records(&info.key()),
            None => Ok(Vec::new()),
        }
    }
}

/// Handle to a running pipeline
pub struct Pipeline {
    sender: Sender<PipelineEvent>,
    worker: JoinHandle<()>,
    dispatcher: Option<Dispatcher>,
    queries: StudyQueries,
    closed: Arc<Broadcast<StudyClosed>>,
    updates: Arc<Broadcast<DoseUpdate>>,
}

impl Pipeline {
    /// Start the worker.
    ///
    /// Held exposures still on disk from an earlier run are loaded back into
    /// the holding buffer first.
    pub fn start(components: PipelineComponents) -> Result<Self> {
        let closed = Arc::new(Broadcast::new());
        let updates = Arc::new(Broadcast::new());
        let queries = StudyQueries::new(Arc::clone(&components.store));

        let mut accumulator = StudyAccumulator::new();
        let held = components.store.held_exposures()?;
        if !held.is_empty() {
            tracing::info!("Restored {} held exposures", held.len());
        }
        for exposure in held {
            accumulator.hold(exposure);
        }

        let worker = Worker {
            components,
            accumulator,
            closed: Arc::clone(&closed),
            updates: Arc::clone(&updates),
        };
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("rdsr-pipeline".into())
            .spawn(move || worker.run(receiver))?;

        Ok(Self {
            sender,
            worker,
            dispatcher: None,
            queries,
            closed,
            updates,
        })
    }

    /// Let the pipeline own the export dispatcher so shutdown stops both
    pub fn attach_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    /// Hand an event to the worker and return immediately
    pub fn submit(&self, event: PipelineEvent) -> Result<()> {
        self.sender.send(event).map_err(|_| Error::PipelineStopped)
    }

    pub fn record_exposure(&self, exposure: ExposureEvent) -> Result<()> {
        self.submit(PipelineEvent::Exposure(exposure))
    }

    pub fn open_study(&self, info: StudyInfo) -> Result<()> {
        self.submit(PipelineEvent::OpenStudy(info))
    }

    pub fn notify_study_closed(&self, study_id: &str, patient_id: &str) -> Result<()> {
        self.submit(PipelineEvent::CloseStudy(StudyKey::new(study_id, patient_id)))
    }

    /// Wait until every event submitted so far has been handled
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(PipelineEvent::Flush(tx))?;
        rx.recv_timeout(timeout).map_err(|_| Error::PipelineStopped)
    }

    pub fn queries(&self) -> &StudyQueries {
        &self.queries
    }

    pub fn get_study_summary(&self, study_id: &str) -> Result<Option<StudySummary>> {
        self.queries.get_study_summary(study_id)
    }

    pub fn get_study_exposures(&self, study_id: &str) -> Result<Vec<DoseRecord>> {
        self.queries.get_study_exposures(study_id)
    }

    /// Study-closed events from now on; nothing earlier is replayed
    pub fn subscribe_study_closed(&self) -> Receiver<StudyClosed> {
        self.closed.subscribe()
    }

    pub fn subscribe_dose_updates(&self) -> Receiver<DoseUpdate> {
        self.updates.subscribe()
    }

    /// Process everything already submitted, then stop the worker and the
    /// dispatcher
    pub fn shutdown(self) {
        let _ = self.sender.send(PipelineEvent::Shutdown);
        if self.worker.join().is_err() {
            tracing::error!("Pipeline worker thread panicked");
        }
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.shutdown();
        }
        tracing::info!("Pipeline stopped");
    }
}

struct Worker {
    components: PipelineComponents,
    accumulator: StudyAccumulator,
    closed: Arc<Broadcast<StudyClosed>>,
    updates: Arc<Broadcast<DoseUpdate>>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<PipelineEvent>) {
        tracing::debug!("Pipeline worker started");
        while let Ok(event) = receiver.recv() {
            let result = match event {
                PipelineEvent::OpenStudy(info) => self.open_study(info),
                PipelineEvent::Exposure(exposure) => self.exposure(exposure),
                PipelineEvent::AssociateHeld { study, device_id } => {
                    self.associate_held(&study, device_id.as_deref())
                }
                PipelineEvent::CloseStudy(key) => self.close_study(&key),
                PipelineEvent::ReloadCalibration => self.reload_calibration(),
                PipelineEvent::Flush(ack) => {
                    let _ = ack.send(());
                    Ok(())
                }
                PipelineEvent::Shutdown => break,
            };
            if let Err(e) = result {
                tracing::error!("Pipeline event failed: {}", e);
            }
        }
        tracing::debug!("Pipeline worker exiting");
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.components.audit.append(event) {
            tracing::error!("Audit append failed: {}", e);
        }
    }

    fn open_study(&mut self, info: StudyInfo) -> Result<()> {
        let key = info.key();
        // A reopened study continues from its ledger records
        let existing = self.components.store.study_records(&key)?;

        self.accumulator.open_study(info.clone(), Utc::now())?;
        if let Err(e) = self.components.store.save_study(&info) {
            self.accumulator.close_study(&key);
            return Err(e);
        }
        for record in &existing {
            self.accumulator.add_exposure(record)?;
        }

        self.audit(
            AuditEvent::new(AuditEventType::StudyOpened, Outcome::Success)
                .study(&key)
                .detail("exam_type", info.exam_type.clone())
                .detail("resumed_exposures", existing.len().to_string()),
        );
        Ok(())
    }

    fn exposure(&mut self, event: ExposureEvent) -> Result<()> {
        let exposure_id = event.exposure_id.unwrap_or_else(Uuid::new_v4);
        let dose = match self.components.calculator.calculate(
            &event.params,
            &event.geometry,
            event.measured_dap,
        ) {
            Ok(dose) => dose,
            Err(e) => {
                let mut audit = AuditEvent::new(AuditEventType::ExposureRejected, Outcome::Failure)
                    .detail("exposure", exposure_id.to_string())
                    .detail("error", e.to_string());
                if let Some(key) = &event.study {
                    audit = audit.study(key);
                }
                self.audit(audit);
                return Err(e);
            }
        };

        let exposure = HeldExposure {
            exposure_id,
            device_id: event.device_id,
            params: event.params,
            geometry: event.geometry,
            dose,
        };

        let study = event.study;
        match study.as_ref().filter(|key| self.accumulator.is_open(key)) {
            Some(key) => self.record(key, exposure).map(|_| ()),
            None => self.hold(exposure, study.as_ref()),
        }
    }

    fn hold(&mut self, exposure: HeldExposure, requested: Option<&StudyKey>) -> Result<()> {
        self.components.store.persist_held(&exposure)?;
        tracing::warn!(
            "No open study for exposure {} on {}; holding",
            exposure.exposure_id,
            exposure.device_id
        );

        let mut audit = AuditEvent::new(AuditEventType::ExposureHeld, Outcome::PartialSuccess)
            .detail("exposure", exposure.exposure_id.to_string())
            .detail("device", exposure.device_id.clone());
        if let Some(key) = requested {
            audit = audit.detail("requested_study", key.to_string());
        }
        self.audit(audit);
        self.accumulator.hold(exposure);
        Ok(())
    }

    /// Persist, audit and accumulate one exposure for an open study
    fn record(&mut self, key: &StudyKey, exposure: HeldExposure) -> Result<DoseRecord> {
        let (exam_type, total_before) = match self.accumulator.totals(key) {
            Some(totals) => (totals.info.exam_type.clone(), totals.total_dap),
            None => return Err(Error::Study(format!("study {} is not open", key))),
        };

        let assessment = self.components.advisor.check(
            &exam_type,
            total_before,
            exposure.dose.effective_dap(),
        );
        let exceeded = assessment.map_or(false, |a| a.exceeded);
        let partial = !exposure.params.mas.is_received();
        let record = exposure.into_record(key, exceeded);

        if let Err(e) = self.components.store.persist(&record) {
            self.audit(
                AuditEvent::new(AuditEventType::ExposureRejected, Outcome::Failure)
                    .study(key)
                    .detail("exposure", record.exposure_id.to_string())
                    .detail("error", e.to_string()),
            );
            return Err(e);
        }

        let outcome = if partial {
            tracing::warn!("Exposure {} recorded without mAs", record.exposure_id);
            Outcome::PartialSuccess
        } else {
            Outcome::Success
        };
        let mut audit = AuditEvent::new(AuditEventType::ExposureRecorded, outcome)
            .study(key)
            .detail("exposure", record.exposure_id.to_string())
            .detail("source", format!("{:?}", record.dose_source).to_lowercase());
        if let Some(dap) = record.effective_dap() {
            audit = audit.detail("dap", format!("{:.6}", dap));
        }
        if partial {
            audit = audit.detail("mas", "not_received");
        }
        self.audit(audit);

        let totals = self.accumulator.add_exposure(&record)?.clone();

        if let Some(assessment) = assessment.filter(|a| a.raise_alert) {
            let alert = assessment.alert(key, &exam_type, record.exposure_id);
            self.components.notifier.threshold_exceeded(&alert);
            self.audit(
                AuditEvent::new(AuditEventType::ThresholdExceeded, Outcome::Success)
                    .severity(Severity::Warning)
                    .study(key)
                    .detail("exposure", record.exposure_id.to_string())
                    .detail("exam_type", exam_type.clone())
                    .detail("reference_level", format!("{:.6}", alert.reference_level))
                    .detail("observed", format!("{:.6}", alert.observed)),
            );
        }

        self.updates.publish(DoseUpdate {
            study: key.clone(),
            exposure_id: record.exposure_id,
            exposure_dap: record.effective_dap(),
            total_dap: totals.total_dap,
            exposure_count: totals.exposure_count,
            threshold_exceeded: totals.threshold_exceeded,
        });
        Ok(record)
    }

    fn associate_held(&mut self, key: &StudyKey, device_id: Option<&str>) -> Result<()> {
        if !self.accumulator.is_open(key) {
            return Err(Error::Study(format!(
                "cannot associate held exposures: study {} is not open",
                key
            )));
        }

        let mut pending = self.accumulator.take_held(device_id).into_iter();
        let mut associated = 0usize;
        while let Some(exposure) = pending.next() {
            let exposure_id = exposure.exposure_id;
            if let Err(e) = self.record(key, exposure.clone()) {
                // Put the failed exposure and everything after it back
                self.accumulator.hold(exposure);
                pending.for_each(|rest| self.accumulator.hold(rest));
                return Err(e);
            }
            self.audit(
                AuditEvent::new(AuditEventType::ExposureAssociated, Outcome::Success)
                    .study(key)
                    .detail("exposure", exposure_id.to_string()),
            );
            associated += 1;

            // The record is final; recovery removes a held file left behind
            if let Err(e) = self.components.store.release_held(exposure_id) {
                pending.for_each(|rest| self.accumulator.hold(rest));
                return Err(e);
            }
        }

        tracing::info!("Associated {} held exposures with study {}", associated, key);
        Ok(())
    }

    fn close_study(&mut self, key: &StudyKey) -> Result<()> {
        if !self.accumulator.is_open(key) {
            return Err(Error::Study(format!("study {} is not open", key)));
        }

        // The study stays open when its records cannot be read back
        let records = match self.components.store.study_records(key) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Cannot read ledger records of study {}: {}", key, e);
                self.audit(
                    AuditEvent::new(AuditEventType::ReportBuildFailed, Outcome::Failure)
                        .study(key)
                        .detail("stage", "ledger_read")
                        .detail("error", e.to_string()),
                );
                return Err(e);
            }
        };
        let totals = self
            .accumulator
            .close_study(key)
            .ok_or_else(|| Error::Study(format!("study {} is not open", key)))?;

        let summary = StudySummary::from_records(&totals.info, &records);
        self.audit(
            AuditEvent::new(AuditEventType::StudyClosed, Outcome::Success)
                .study(key)
                .detail("total_dap", format!("{:.6}", summary.total_dap))
                .detail("exposures", summary.exposure_count.to_string()),
        );

        let export_item = match self.components.builder.build(&summary, &records) {
            Ok(report) => {
                self.audit(
                    AuditEvent::new(AuditEventType::ReportBuilt, Outcome::Success)
                        .study(key)
                        .detail("document", report.document_id.to_string())
                        .detail("events", records.len().to_string()),
                );
                match self
                    .components
                    .export
                    .enqueue(&report, &self.components.destination)
                {
                    Ok(item) => Some(item.id),
                    Err(e) => {
                        tracing::error!("Could not queue report for study {}: {}", key, e);
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Report for study {} not built: {}", key, e);
                let mut audit = AuditEvent::new(AuditEventType::ReportBuildFailed, Outcome::Failure)
                    .study(key)
                    .detail("error", e.to_string());
                if let Error::Validation(invalid) = &e {
                    audit = audit.detail("missing", invalid.missing.join(","));
                }
                self.audit(audit);
                None
            }
        };

        let delivered = self.closed.publish(StudyClosed {
            study: key.clone(),
            total_dap: summary.total_dap,
            exposure_count: summary.exposure_count,
            export_item,
            closed_at: Utc::now(),
        });
        tracing::debug!("Study-closed event for {} sent to {} subscribers", key, delivered);
        Ok(())
    }

    fn reload_calibration(&self) -> Result<()> {
        match &self.components.calibration {
            Some(store) => store.reload().map(|_| ()),
            None => {
                tracing::warn!("Calibration reload requested but no calibration store is attached");
                Ok(())
            }
        }
    }
}
