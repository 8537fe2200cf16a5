//! Configuration file support for rdsr.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/rdsr/config.toml`.

use crate::export_queue::RetryPolicy;
use crate::threshold::ReferenceLevels;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Advisory reference levels keyed by exam type
    #[serde(default)]
    pub reference_levels: ReferenceLevels,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Signed calibration source
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Relative paths are resolved against the data directory
    #[serde(default = "default_calibration_path")]
    pub path: PathBuf,

    /// Hex HMAC key; `RDSR_CALIBRATION_KEY` takes precedence
    #[serde(default)]
    pub signing_key: Option<String>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: default_calibration_path(),
            signing_key: None,
        }
    }
}

/// Report export configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Where the file-drop transport writes delivered reports.
    /// Relative paths are resolved against the data directory.
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,

    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            outbox_dir: default_outbox_dir(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
        }
    }
}

/// Acquisition-side timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// How long to wait for the mAs reading before recording it as absent
    #[serde(default = "default_mas_timeout_ms")]
    pub mas_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mas_timeout_ms: default_mas_timeout_ms(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rdsr")
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("calibration.toml")
}

fn default_destination() -> String {
    "PACS".into()
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_dispatch_interval_ms() -> u64 {
    1_000
}

fn default_mas_timeout_ms() -> u64 {
    2_000
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rdsr")
            .join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        for (exam_type, level) in &self.reference_levels {
            if !level.dap.is_finite() || level.dap <= 0.0 {
                return Err(Error::Config(format!(
                    "reference level for '{}' must be positive, got {}",
                    exam_type, level.dap
                )));
            }
        }
        if self.export.destination.is_empty() {
            return Err(Error::Config("export.destination must not be empty".into()));
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data.data_dir.join(path)
        }
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.data.data_dir.join("ledger")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data.data_dir.join("audit").join("audit.log")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data.data_dir.join("queue")
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.resolve(&self.calibration.path)
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.resolve(&self.export.outbox_dir)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.export.delivery_timeout_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.export.dispatch_interval_ms)
    }

    pub fn mas_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.mas_timeout_ms)
    }
}
