//! Hand-off of finished reports to the remote archive.
//!
//! Association, transfer syntax and transport security belong to the
//! [`Transport`] implementation. The queue only sees success or failure.

use crate::error::TransportError;
use crate::report::ReportDocument;
use crate::storage;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub trait Transport: Send + Sync {
    /// Store one report object at `destination`
    fn store(&self, report: &ReportDocument, destination: &str) -> Result<(), TransportError>;
}

/// Writes each delivered report into `<outbox>/<destination>/<document_id>.json`.
#[derive(Clone, Debug)]
pub struct FileDropTransport {
    outbox: PathBuf,
}

impl FileDropTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
        }
    }
}

impl Transport for FileDropTransport {
    fn store(&self, report: &ReportDocument, destination: &str) -> Result<(), TransportError> {
        if destination.is_empty() || destination.contains(['/', '\\']) || destination.starts_with('.') {
            return Err(TransportError::Rejected(format!(
                "invalid destination '{}'",
                destination
            )));
        }
        let path = self
            .outbox
            .join(destination)
            .join(format!("{}.json", report.document_id));
        std::fs::create_dir_all(self.outbox.join(destination))
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        storage::atomic_write_json(&path, report, true)
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        tracing::info!(
            "Stored report {} ({}) at {:?}",
            report.document_id,
            report.sop_class_uid,
            path
        );
        Ok(())
    }
}

/// Run one delivery attempt, giving up after `timeout`.
///
/// The attempt runs on its own thread; a hung transport is abandoned and
/// reported as [`TransportError::TimedOut`].
pub fn deliver_with_timeout(
    transport: Arc<dyn Transport>,
    report: ReportDocument,
    destination: String,
    timeout: Duration,
) -> Result<(), TransportError> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("rdsr-delivery".into())
        .spawn(move || {
            let _ = tx.send(transport.store(&report, &destination));
        })
        .map_err(|e| TransportError::Unreachable(format!("cannot start delivery: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut(timeout.as_millis() as u64)),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Rejected(
            "delivery attempt terminated without a result".into(),
        )),
    }
}
