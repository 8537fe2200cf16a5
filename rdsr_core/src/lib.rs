#![forbid(unsafe_code)]

//! Core of the radiation dose capture, audit and structured-report export
//! pipeline.
//!
//! This crate provides:
//! - Domain types (exposures, dose records, studies)
//! - Calibration loading and DAP calculation
//! - Durable persistence (dose ledger, hash-chained audit trail, export queue)
//! - Per-study accumulation and advisory reference-level checks
//! - Dose report construction and delivery
//! - The pipeline orchestrator tying these together

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod storage;
pub mod calibration;
pub mod dap;
pub mod ledger;
pub mod audit;
pub mod accumulator;
pub mod threshold;
pub mod report;
pub mod transport;
pub mod export_queue;
pub mod notify;
pub mod events;
pub mod pipeline;

// Re-export commonly used types
pub use error::{Error, ReportValidationError, Result, TransportError};
pub use types::*;
pub use config::Config;
pub use audit::{AuditTrail, ChainReport, ChainStatus};
pub use calibration::{CalibrationCoefficients, CalibrationStore, SigningKey};
pub use dap::{calculate_dap, DapCalculator, DoseCalculator};
pub use ledger::{DoseLedger, DoseStore};
pub use export_queue::{ExportQueue, QueueItem, QueueState, RetryPolicy};
pub use report::{DoseReportBuilder, ReportBuilder, ReportDocument};
pub use transport::{FileDropTransport, Transport};
pub use pipeline::{ExposureEvent, Pipeline, PipelineComponents, PipelineEvent, StudyQueries};
