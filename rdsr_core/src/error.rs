//! Error types for the rdsr_core library.

use std::fmt;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for rdsr_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Report could not be built because mandatory fields are missing
    #[error("Report validation failed: {0}")]
    Validation(#[from] ReportValidationError),

    /// A record could not be durably written or promoted
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Delivery to the remote archive was rejected or timed out
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The audit hash chain is broken
    #[error("Integrity error: audit chain broken at entry {index}: {reason}")]
    Integrity { index: usize, reason: String },

    /// A calibration update was rejected (bad signature or invalid values)
    #[error("Calibration rejected: {0}")]
    CalibrationRejected(String),

    /// Exposure parameters cannot produce a dose value
    #[error("Invalid exposure: {0}")]
    InvalidExposure(String),

    /// Study lifecycle error (unknown study, patient conflict)
    #[error("Study error: {0}")]
    Study(String),

    /// The pipeline worker is no longer accepting events
    #[error("Pipeline is not running")]
    PipelineStopped,
}

/// Every mandatory field that was missing when a report build was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportValidationError {
    pub missing: Vec<String>,
}

impl fmt::Display for ReportValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing mandatory fields: {}", self.missing.join(", "))
    }
}

impl std::error::Error for ReportValidationError {}

/// Failure of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("delivery timed out after {0} ms")]
    TimedOut(u64),

    #[error("destination unreachable: {0}")]
    Unreachable(String),
}
