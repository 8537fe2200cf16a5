//! Durable, retrying delivery queue for finished reports.
//!
//! Layout under the queue root:
//!
//! ```text
//! items/<item_id>.json      queue item state
//! payloads/<item_id>.json   serialized report
//! ```
//!
//! Both are written with the temp + atomic rename discipline used by the
//! ledger. Items move `Pending -> Retrying -> Complete | Failed` and are
//! never deleted; `Complete` and `Failed` are terminal.
//!
//! The queue lock covers index updates and file writes only. Delivery runs
//! with the lock released so a slow archive cannot stall enqueueing.

use crate::audit::{AuditEvent, AuditEventType, AuditTrail, Outcome, Severity};
use crate::error::TransportError;
use crate::notify::{Notifier, OperatorNotice};
use crate::report::ReportDocument;
use crate::storage::{self, DirLock, RecoveryReport};
use crate::transport::{deliver_with_timeout, Transport};
use crate::{Error, Result, StudyKey};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Delivery lifecycle of a queue item
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Retrying,
    Complete,
    Failed,
}

impl QueueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueState::Complete | QueueState::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: Uuid,
    pub study_id: String,
    pub patient_id: String,
    pub document_id: Uuid,
    /// Payload file, relative to the queue root
    pub payload: String,
    pub destination: String,
    pub state: QueueState,
    pub attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set on items created by an operator requeue of a failed item
    pub requeued_from: Option<Uuid>,
}

impl QueueItem {
    pub fn study(&self) -> StudyKey {
        StudyKey::new(&self.study_id, &self.patient_id)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Backoff schedule and retry budget
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_interval_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    600_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl RetryPolicy {
    /// `min(initial * multiplier^previous_attempts, max)`
    pub fn delay_after(&self, previous_attempts: u32) -> ChronoDuration {
        let exponent = i32::try_from(previous_attempts).unwrap_or(i32::MAX);
        let raw = self.initial_interval_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_interval_ms as f64).max(0.0);
        ChronoDuration::milliseconds(capped.round() as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config("retry.backoff_multiplier must be >= 1.0".into()));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(Error::Config(
                "retry.max_interval_ms must not be below initial_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

/// What happened to an item after one delivery attempt
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    RetryScheduled { next_retry_at: DateTime<Utc> },
    Failed,
    /// The item was already terminal; nothing changed
    Ignored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Capability to hand a report over for guaranteed delivery
pub trait ExportSink: Send + Sync {
    fn enqueue(&self, report: &ReportDocument, destination: &str) -> Result<QueueItem>;
}

#[derive(Default)]
struct QueueIndex {
    items: HashMap<Uuid, QueueItem>,
    /// Pending and Retrying items
    active: BTreeSet<Uuid>,
}

impl QueueIndex {
    fn insert(&mut self, item: QueueItem) {
        if item.state.is_terminal() {
            self.active.remove(&item.id);
        } else {
            self.active.insert(item.id);
        }
        self.items.insert(item.id, item);
    }
}

pub struct ExportQueue {
    root: PathBuf,
    policy: RetryPolicy,
    index: Mutex<QueueIndex>,
    audit: Arc<AuditTrail>,
    notifier: Arc<dyn Notifier>,
    recovered: RecoveryReport,
}

impl ExportQueue {
    /// Open the queue, recovering interrupted writes and reloading every item
    pub fn open(
        root: impl Into<PathBuf>,
        policy: RetryPolicy,
        audit: Arc<AuditTrail>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        policy.validate()?;
        let mut queue = Self {
            root: root.into(),
            policy,
            index: Mutex::new(QueueIndex::default()),
            audit,
            notifier,
            recovered: RecoveryReport::default(),
        };
        queue.recovered = queue.recover()?;
        Ok(queue)
    }

    /// Temporary artifacts resolved when the queue was opened
    pub fn recovered(&self) -> &RecoveryReport {
        &self.recovered
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    fn payloads_dir(&self) -> PathBuf {
        self.root.join("payloads")
    }

    fn item_path(&self, id: Uuid) -> PathBuf {
        self.items_dir().join(format!("{}.json", id))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, QueueIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload durable state into the in-memory index.
    ///
    /// Pending and Retrying items become schedulable again; Complete and
    /// Failed items are loaded for lookup and deduplication only.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut index = self.lock_index();
        let _dir_lock = DirLock::acquire(&self.root)?;
        std::fs::create_dir_all(self.items_dir())?;
        std::fs::create_dir_all(self.payloads_dir())?;

        // Payloads are promoted before their item is written, so a payload
        // still in temporary form never has an item referring to it.
        let mut report = RecoveryReport::default();
        for orphan in storage::temp_artifacts(&self.payloads_dir())? {
            tracing::warn!("Discarding unreferenced payload artifact {:?}", orphan);
            std::fs::remove_file(&orphan)?;
            report.discarded += 1;
        }
        report.merge(storage::recover_temp_artifacts::<QueueItem>(&self.items_dir(), |item| {
            self.item_path(item.id)
        })?);

        *index = QueueIndex::default();
        for path in storage::list_json(&self.items_dir())? {
            match storage::read_json::<QueueItem>(&path) {
                Ok(item) => index.insert(item),
                Err(e) => tracing::warn!("Skipping unreadable queue item {:?}: {}", path, e),
            }
        }
        let total = index.items.len();
        let active = index.active.len();
        drop(_dir_lock);
        drop(index);

        tracing::info!("Export queue recovered: {} items, {} active", total, active);
        self.audit.append(
            AuditEvent::new(AuditEventType::QueueRecovered, Outcome::Success)
                .detail("items", total.to_string())
                .detail("active", active.to_string())
                .detail("promoted", report.promoted.to_string())
                .detail("discarded", report.discarded.to_string()),
        )?;
        Ok(report)
    }

    /// Queue a report for `destination` as of `now`.
    ///
    /// Enqueuing the same report document for the same destination again
    /// returns the existing item unless that item has failed. A rebuilt report
    /// for the same study carries a new document id and is always queued.
    pub fn enqueue_at(
        &self,
        report: &ReportDocument,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let item = {
            let mut index = self.lock_index();
            let existing = index.items.values().find(|i| {
                i.document_id == report.document_id
                    && i.destination == destination
                    && i.state != QueueState::Failed
            });
            if let Some(existing) = existing {
                tracing::info!(
                    "Report {} to {} already queued as {}",
                    report.document_id,
                    destination,
                    existing.id
                );
                return Ok(existing.clone());
            }

            let id = Uuid::new_v4();
            let payload = format!("payloads/{}.json", id);
            let item = QueueItem {
                id,
                study_id: report.study_id.clone(),
                patient_id: report.patient_id.clone(),
                document_id: report.document_id,
                payload: payload.clone(),
                destination: destination.to_string(),
                state: QueueState::Pending,
                attempts: 0,
                created_at: now,
                last_attempt_at: None,
                next_retry_at: None,
                last_error: None,
                requeued_from: None,
            };

            let _dir_lock = DirLock::acquire(&self.root)?;
            storage::atomic_write_json(&self.root.join(&payload), report, false)?;
            storage::atomic_write_json(&self.item_path(id), &item, false)?;
            index.insert(item.clone());
            item
        };

        tracing::info!("Queued report {} for {} as {}", item.document_id, destination, item.id);
        self.audit.append(
            AuditEvent::new(AuditEventType::ExportQueued, Outcome::Success)
                .study(&item.study())
                .detail("item", item.id.to_string())
                .detail("destination", destination),
        )?;
        Ok(item)
    }

    pub fn get(&self, id: Uuid) -> Option<QueueItem> {
        self.lock_index().items.get(&id).cloned()
    }

    /// Every known item, oldest first
    pub fn items(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.lock_index().items.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Number of items still scheduled for delivery
    pub fn active_count(&self) -> usize {
        self.lock_index().active.len()
    }

    /// Items due for an attempt at `now`, oldest first
    pub fn due_items(&self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let index = self.lock_index();
        let mut due: Vec<QueueItem> = index
            .active
            .iter()
            .filter_map(|id| index.items.get(id))
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        due
    }

    /// Load the report an item refers to
    pub fn payload(&self, item: &QueueItem) -> Result<ReportDocument> {
        storage::read_json(&self.root.join(&item.payload))
    }

    /// Attempt delivery of every due item
    pub fn dispatch_due(
        &self,
        transport: &Arc<dyn Transport>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();

        for item in self.due_items(now) {
            let result = match self.payload(&item) {
                Ok(report) => deliver_with_timeout(
                    Arc::clone(transport),
                    report,
                    item.destination.clone(),
                    timeout,
                ),
                Err(e) => Err(TransportError::Rejected(format!("payload unavailable: {}", e))),
            };

            summary.attempted += 1;
            match self.record_attempt(item.id, result, now)? {
                DeliveryOutcome::Delivered => summary.delivered += 1,
                DeliveryOutcome::RetryScheduled { .. } => summary.retried += 1,
                DeliveryOutcome::Failed => summary.failed += 1,
                DeliveryOutcome::Ignored => summary.attempted -= 1,
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                "Dispatch: {} attempted, {} delivered, {} retrying, {} failed",
                summary.attempted,
                summary.delivered,
                summary.retried,
                summary.failed
            );
        }
        Ok(summary)
    }

    /// Apply the result of one delivery attempt made at `attempted_at`
    pub fn record_attempt(
        &self,
        id: Uuid,
        result: std::result::Result<(), TransportError>,
        attempted_at: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        let (item, outcome) = {
            let mut index = self.lock_index();
            let current = index
                .items
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::Persistence(format!("unknown queue item {}", id)))?;
            if current.state.is_terminal() {
                return Ok(DeliveryOutcome::Ignored);
            }

            let mut item = current;
            item.attempts += 1;
            item.last_attempt_at = Some(attempted_at);

            let outcome = match &result {
                Ok(()) => {
                    item.state = QueueState::Complete;
                    item.next_retry_at = None;
                    item.last_error = None;
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    item.last_error = Some(e.to_string());
                    if item.attempts >= self.policy.max_attempts {
                        item.state = QueueState::Failed;
                        item.next_retry_at = None;
                        DeliveryOutcome::Failed
                    } else {
                        let next = attempted_at + self.policy.delay_after(item.attempts - 1);
                        item.state = QueueState::Retrying;
                        item.next_retry_at = Some(next);
                        DeliveryOutcome::RetryScheduled { next_retry_at: next }
                    }
                }
            };

            let _dir_lock = DirLock::acquire(&self.root)?;
            storage::atomic_write_json(&self.item_path(id), &item, true)?;
            index.insert(item.clone());
            (item, outcome)
        };

        self.report_attempt(&item, &outcome)?;
        Ok(outcome)
    }

    fn report_attempt(&self, item: &QueueItem, outcome: &DeliveryOutcome) -> Result<()> {
        let base = |event_type, result| {
            AuditEvent::new(event_type, result)
                .study(&item.study())
                .detail("item", item.id.to_string())
                .detail("destination", item.destination.clone())
                .detail("attempts", item.attempts.to_string())
        };

        let event = match outcome {
            DeliveryOutcome::Delivered => {
                tracing::info!("Delivered {} to {}", item.id, item.destination);
                base(AuditEventType::ExportDelivered, Outcome::Success)
            }
            DeliveryOutcome::RetryScheduled { next_retry_at } => {
                tracing::warn!(
                    "Delivery of {} failed (attempt {}), retry at {}: {}",
                    item.id,
                    item.attempts,
                    next_retry_at,
                    item.last_error.as_deref().unwrap_or("")
                );
                base(AuditEventType::ExportRetryScheduled, Outcome::Failure)
                    .severity(Severity::Warning)
                    .detail("next_retry_at", next_retry_at.to_rfc3339())
                    .detail("error", item.last_error.clone().unwrap_or_default())
            }
            DeliveryOutcome::Failed => {
                self.notifier.export_failed(&OperatorNotice {
                    item_id: item.id,
                    study_id: item.study_id.clone(),
                    destination: item.destination.clone(),
                    attempts: item.attempts,
                    last_error: item.last_error.clone(),
                });
                base(AuditEventType::ExportFailed, Outcome::Failure)
                    .severity(Severity::Warning)
                    .detail("error", item.last_error.clone().unwrap_or_default())
            }
            DeliveryOutcome::Ignored => return Ok(()),
        };
        self.audit.append(event)?;
        Ok(())
    }

    /// Operator action: give a failed item a fresh retry budget.
    ///
    /// The failed item is left untouched; a new pending item pointing at the
    /// same payload is created.
    pub fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<QueueItem> {
        let item = {
            let mut index = self.lock_index();
            let failed = index
                .items
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::Persistence(format!("unknown queue item {}", id)))?;
            if failed.state != QueueState::Failed {
                return Err(Error::Persistence(format!(
                    "queue item {} is {:?}, only failed items can be requeued",
                    id, failed.state
                )));
            }

            let item = QueueItem {
                id: Uuid::new_v4(),
                state: QueueState::Pending,
                attempts: 0,
                created_at: now,
                last_attempt_at: None,
                next_retry_at: None,
                last_error: None,
                requeued_from: Some(id),
                ..failed
            };
            let _dir_lock = DirLock::acquire(&self.root)?;
            storage::atomic_write_json(&self.item_path(item.id), &item, false)?;
            index.insert(item.clone());
            item
        };

        tracing::info!("Requeued failed item {} as {}", id, item.id);
        self.audit.append(
            AuditEvent::new(AuditEventType::ExportRequeued, Outcome::Success)
                .study(&item.study())
                .detail("item", item.id.to_string())
                .detail("requeued_from", id.to_string()),
        )?;
        Ok(item)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ExportSink for ExportQueue {
    fn enqueue(&self, report: &ReportDocument, destination: &str) -> Result<QueueItem> {
        self.enqueue_at(report, destination, Utc::now())
    }
}

/// Background thread calling [`ExportQueue::dispatch_due`] on an interval
pub struct Dispatcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(
        queue: Arc<ExportQueue>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        delivery_timeout: Duration,
    ) -> Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("rdsr-dispatcher".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = queue.dispatch_due(&transport, Utc::now(), delivery_timeout) {
                            tracing::error!("Export dispatch failed: {}", e);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    pub fn shutdown(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("Export dispatcher thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::fixtures::sample_report;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingNotifier {
        failures: Mutex<Vec<OperatorNotice>>,
    }

    impl Notifier for RecordingNotifier {
        fn threshold_exceeded(&self, _: &crate::threshold::ThresholdAlert) {}

        fn export_failed(&self, notice: &OperatorNotice) {
            self.failures.lock().unwrap().push(notice.clone());
        }
    }

    /// Fails the first `failures` calls, then succeeds
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Transport for Flaky {
        fn store(&self, _: &ReportDocument, _: &str) -> std::result::Result<(), TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(TransportError::Rejected("association rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: usize) -> Arc<dyn Transport> {
        Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    /// Blocks inside `store` until released
    struct Gate {
        entered: Mutex<Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Transport for Gate {
        fn store(&self, _: &ReportDocument, _: &str) -> std::result::Result<(), TransportError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(10));
            Ok(())
        }
    }

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_interval_ms: 1000,
            backoff_multiplier: 2.0,
            max_interval_ms: 60_000,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        audit: Arc<AuditTrail>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("queue");
            let audit = Arc::new(AuditTrail::open(dir.path().join("audit.log")).unwrap());
            Self {
                _dir: dir,
                root,
                audit,
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn open(&self) -> ExportQueue {
            ExportQueue::open(
                &self.root,
                test_policy(),
                Arc::clone(&self.audit),
                self.notifier.clone(),
            )
            .unwrap()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_backoff_schedule() {
        let policy = test_policy();
        assert_eq!(policy.delay_after(0), ChronoDuration::milliseconds(1000));
        assert_eq!(policy.delay_after(1), ChronoDuration::milliseconds(2000));
        assert_eq!(policy.delay_after(2), ChronoDuration::milliseconds(4000));
        assert_eq!(policy.delay_after(20), ChronoDuration::milliseconds(60_000));
    }

    #[test]
    fn test_three_failures_then_failed() {
        let fx = Fixture::new();
        let queue = fx.open();
        let transport = flaky(usize::MAX);
        let t0 = Utc::now();

        let item = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();
        assert_eq!(item.state, QueueState::Pending);

        let s1 = queue.dispatch_due(&transport, t0, TIMEOUT).unwrap();
        assert_eq!(s1.retried, 1);
        let after1 = queue.get(item.id).unwrap();
        assert_eq!(after1.state, QueueState::Retrying);
        assert_eq!(after1.next_retry_at, Some(t0 + ChronoDuration::milliseconds(1000)));

        // Not due yet
        assert_eq!(queue.dispatch_due(&transport, t0, TIMEOUT).unwrap().attempted, 0);

        let t1 = t0 + ChronoDuration::milliseconds(1000);
        queue.dispatch_due(&transport, t1, TIMEOUT).unwrap();
        let after2 = queue.get(item.id).unwrap();
        assert_eq!(after2.state, QueueState::Retrying);
        assert_eq!(after2.next_retry_at, Some(t1 + ChronoDuration::milliseconds(2000)));

        let t2 = t1 + ChronoDuration::milliseconds(2000);
        let s3 = queue.dispatch_due(&transport, t2, TIMEOUT).unwrap();
        assert_eq!(s3.failed, 1);
        let after3 = queue.get(item.id).unwrap();
        assert_eq!(after3.state, QueueState::Failed);
        assert_eq!(after3.attempts, 3);
        assert_eq!(after3.next_retry_at, None);
        assert!(after3.last_error.unwrap().contains("association rejected"));

        // No further scheduling
        let later = t2 + ChronoDuration::hours(1);
        assert!(queue.due_items(later).is_empty());
        assert_eq!(fx.notifier.failures.lock().unwrap().len(), 1);

        // Still on disk
        assert!(fx.root.join("items").join(format!("{}.json", item.id)).exists());
    }

    #[test]
    fn test_success_after_retry_completes() {
        let fx = Fixture::new();
        let queue = fx.open();
        let transport = flaky(1);
        let t0 = Utc::now();
        let item = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();

        queue.dispatch_due(&transport, t0, TIMEOUT).unwrap();
        let summary = queue
            .dispatch_due(&transport, t0 + ChronoDuration::seconds(1), TIMEOUT)
            .unwrap();
        assert_eq!(summary.delivered, 1);

        let done = queue.get(item.id).unwrap();
        assert_eq!(done.state, QueueState::Complete);
        assert_eq!(done.attempts, 2);
        assert_eq!(queue.active_count(), 0);

        let events: Vec<AuditEventType> = fx.audit.entries().unwrap().iter().map(|e| e.event_type).collect();
        assert!(events.contains(&AuditEventType::ExportRetryScheduled));
        assert!(events.contains(&AuditEventType::ExportDelivered));
    }

    #[test]
    fn test_terminal_state_is_not_reopened() {
        let fx = Fixture::new();
        let queue = fx.open();
        let t0 = Utc::now();
        let item = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();

        queue.record_attempt(item.id, Ok(()), t0).unwrap();
        let outcome = queue
            .record_attempt(item.id, Err(TransportError::TimedOut(10)), t0)
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Ignored);
        assert_eq!(queue.get(item.id).unwrap().state, QueueState::Complete);
    }

    #[test]
    fn test_timeout_counts_as_failed_attempt() {
        let fx = Fixture::new();
        let queue = fx.open();
        let t0 = Utc::now();
        let item = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();

        let outcome = queue
            .record_attempt(item.id, Err(TransportError::TimedOut(5000)), t0)
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::RetryScheduled { .. }));
        assert_eq!(queue.get(item.id).unwrap().state, QueueState::Retrying);
    }

    #[test]
    fn test_recovery_reloads_active_items_only_for_scheduling() {
        let fx = Fixture::new();
        let t0 = Utc::now();
        let delivered_report = sample_report("S3", "P3");
        let (pending, retrying, complete) = {
            let queue = fx.open();
            let pending = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();
            let retrying = queue.enqueue_at(&sample_report("S2", "P2"), "PACS", t0).unwrap();
            let complete = queue.enqueue_at(&delivered_report, "PACS", t0).unwrap();
            queue
                .record_attempt(retrying.id, Err(TransportError::Unreachable("down".into())), t0)
                .unwrap();
            queue.record_attempt(complete.id, Ok(()), t0).unwrap();
            (pending, retrying, complete)
        };

        let reopened = fx.open();
        assert_eq!(reopened.items().len(), 3);
        assert_eq!(reopened.active_count(), 2);
        assert_eq!(reopened.get(retrying.id).unwrap().state, QueueState::Retrying);

        let due: Vec<Uuid> = reopened
            .due_items(t0 + ChronoDuration::minutes(5))
            .iter()
            .map(|i| i.id)
            .collect();
        assert!(due.contains(&pending.id));
        assert!(due.contains(&retrying.id));
        assert!(!due.contains(&complete.id));

        // The same document is not queued twice, even once delivered
        let again = reopened.enqueue_at(&delivered_report, "PACS", t0).unwrap();
        assert_eq!(again.id, complete.id);
    }

    #[test]
    fn test_rebuilt_report_for_same_study_is_queued() {
        let fx = Fixture::new();
        let queue = fx.open();
        let t0 = Utc::now();

        let first = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();
        queue.record_attempt(first.id, Ok(()), t0).unwrap();

        let rebuilt = sample_report("S1", "P1");
        let second = queue.enqueue_at(&rebuilt, "PACS", t0).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.state, QueueState::Pending);
        assert_eq!(second.document_id, rebuilt.document_id);
        assert_eq!(queue.payload(&second).unwrap(), rebuilt);
        assert_eq!(queue.get(first.id).unwrap().state, QueueState::Complete);

        // Another destination gets its own item for the same document
        let elsewhere = queue.enqueue_at(&rebuilt, "ARCHIVE", t0).unwrap();
        assert_ne!(elsewhere.id, second.id);
    }

    #[test]
    fn test_recovery_promotes_orphaned_item_write() {
        let fx = Fixture::new();
        let t0 = Utc::now();
        let item = fx.open().enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();

        // Crash between the temp write and the rename of a state update
        let mut updated = item.clone();
        updated.state = QueueState::Retrying;
        updated.attempts = 1;
        std::fs::remove_file(fx.root.join("items").join(format!("{}.json", item.id))).unwrap();
        storage::write_temp_json(&fx.root.join("items"), &updated)
            .unwrap()
            .keep()
            .unwrap();

        let reopened = fx.open();
        assert_eq!(reopened.get(item.id).unwrap().state, QueueState::Retrying);
        assert!(storage::temp_artifacts(&fx.root.join("items")).unwrap().is_empty());
    }

    #[test]
    fn test_requeue_failed_item() {
        let fx = Fixture::new();
        let queue = fx.open();
        let t0 = Utc::now();
        let item = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();
        assert!(queue.requeue(item.id, t0).is_err());

        for _ in 0..3 {
            queue
                .record_attempt(item.id, Err(TransportError::Rejected("no".into())), t0)
                .unwrap();
        }
        assert_eq!(queue.get(item.id).unwrap().state, QueueState::Failed);

        let fresh = queue.requeue(item.id, t0).unwrap();
        assert_eq!(fresh.state, QueueState::Pending);
        assert_eq!(fresh.requeued_from, Some(item.id));
        assert_eq!(fresh.payload, item.payload);
        assert_eq!(queue.get(item.id).unwrap().state, QueueState::Failed);

        let delivered = queue.dispatch_due(&flaky(0), t0, TIMEOUT).unwrap();
        assert_eq!(delivered.delivered, 1);
    }

    #[test]
    fn test_queue_stays_usable_while_delivery_blocks() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.open());
        let t0 = Utc::now();
        let blocked = queue.enqueue_at(&sample_report("S1", "P1"), "PACS", t0).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let transport: Arc<dyn Transport> = Arc::new(Gate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let dispatching = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dispatch_due(&transport, t0, TIMEOUT).unwrap())
        };
        entered_rx.recv_timeout(TIMEOUT).unwrap();

        // Delivery is in progress; the index must not be held by it
        let started = std::time::Instant::now();
        let other = queue.enqueue_at(&sample_report("S2", "P2"), "PACS", t0).unwrap();
        assert_eq!(queue.get(blocked.id).unwrap().state, QueueState::Pending);
        assert_eq!(queue.items().len(), 2);
        assert_eq!(queue.due_items(t0).len(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));

        release_tx.send(()).unwrap();
        let summary = dispatching.join().unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(queue.get(blocked.id).unwrap().state, QueueState::Complete);
        assert_eq!(queue.get(other.id).unwrap().state, QueueState::Pending);
    }

    #[test]
    fn test_dispatcher_thread_delivers() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.open());
        let item = queue.enqueue(&sample_report("S1", "P1"), "PACS").unwrap();

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&queue),
            flaky(0),
            Duration::from_millis(10),
            TIMEOUT,
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.get(item.id).unwrap().state != QueueState::Complete
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        dispatcher.shutdown();
        assert_eq!(queue.get(item.id).unwrap().state, QueueState::Complete);
    }
}
