//! Signed calibration coefficients with atomic snapshot reloads.
//!
//! The coefficient file is TOML with a `[coefficients]` table and a
//! `[signature]` table. The signature is HMAC-SHA256 over the compact JSON
//! encoding of the coefficients, hex encoded.

use crate::audit::{AuditEvent, AuditEventType, AuditTrail, Outcome, Severity};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

type HmacSha256 = Hmac<Sha256>;

/// The only accepted signature algorithm
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

/// Environment variable overriding the configured signing key
pub const KEY_ENV_VAR: &str = "RDSR_CALIBRATION_KEY";

/// Calibration coefficients for the DAP formula
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationCoefficients {
    pub k_factor: f64,
    pub exponent: f64,
    pub calibration_constant: f64,
    pub version: u32,
    pub issued_at: DateTime<Utc>,
}

impl CalibrationCoefficients {
    fn validate(&self) -> std::result::Result<(), String> {
        let fields = [
            ("k_factor", self.k_factor),
            ("exponent", self.exponent),
            ("calibration_constant", self.calibration_constant),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{} must be finite and positive, got {}", name, value));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "v{} k={} n={} c={}",
            self.version, self.k_factor, self.exponent, self.calibration_constant
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationSignature {
    pub algorithm: String,
    pub value: String,
}

/// On-disk form of a calibration file
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedCalibration {
    pub coefficients: CalibrationCoefficients,
    pub signature: CalibrationSignature,
}

/// Shared secret used to sign and verify calibration files
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::Config(format!("Invalid calibration signing key: {}", e)))?;
        if bytes.is_empty() {
            return Err(Error::Config("Calibration signing key is empty".into()));
        }
        Ok(Self(bytes))
    }

    /// Resolve the key from the environment, falling back to `configured`
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        match std::env::var(KEY_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => Self::from_hex(&value),
            _ => match configured {
                Some(value) => Self::from_hex(value),
                None => Err(Error::Config(format!(
                    "No calibration signing key configured (set calibration.signing_key or {})",
                    KEY_ENV_VAR
                ))),
            },
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0)
            .map_err(|e| Error::Config(format!("Invalid calibration signing key: {}", e)))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

fn canonical_bytes(coefficients: &CalibrationCoefficients) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(coefficients)?)
}

/// Sign a coefficient set
pub fn sign(coefficients: CalibrationCoefficients, key: &SigningKey) -> Result<SignedCalibration> {
    let mut mac = key.mac()?;
    mac.update(&canonical_bytes(&coefficients)?);
    let value = hex::encode(mac.finalize().into_bytes());
    Ok(SignedCalibration {
        coefficients,
        signature: CalibrationSignature {
            algorithm: SIGNATURE_ALGORITHM.into(),
            value,
        },
    })
}

/// Check the signature and values of a signed file
pub fn verify(signed: &SignedCalibration, key: &SigningKey) -> std::result::Result<(), String> {
    if signed.signature.algorithm != SIGNATURE_ALGORITHM {
        return Err(format!(
            "unsupported signature algorithm '{}'",
            signed.signature.algorithm
        ));
    }
    let expected = hex::decode(&signed.signature.value)
        .map_err(|e| format!("malformed signature: {}", e))?;
    let bytes = canonical_bytes(&signed.coefficients).map_err(|e| e.to_string())?;

    let mut mac = key.mac().map_err(|e| e.to_string())?;
    mac.update(&bytes);
    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch".to_string())?;

    signed.coefficients.validate()
}

/// Write a signed calibration file
pub fn write_signed(path: &Path, signed: &SignedCalibration) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(signed)
        .map_err(|e| Error::Config(format!("Failed to serialize calibration: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

fn read_signed(path: &Path) -> std::result::Result<SignedCalibration, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("cannot read {:?}: {}", path, e))?;
    toml::from_str(&contents).map_err(|e| format!("cannot parse {:?}: {}", path, e))
}

/// Holds the active coefficient snapshot.
///
/// Readers clone the `Arc` and keep a self-consistent set for as long as they
/// need it; a reload swaps in a new `Arc` only after full verification.
pub struct CalibrationStore {
    path: PathBuf,
    key: SigningKey,
    active: RwLock<Arc<CalibrationCoefficients>>,
    audit: Arc<AuditTrail>,
}

impl CalibrationStore {
    /// Load and verify the calibration file at startup
    pub fn open(path: impl Into<PathBuf>, key: SigningKey, audit: Arc<AuditTrail>) -> Result<Self> {
        let path = path.into();
        let signed = match read_signed(&path).and_then(|s| verify(&s, &key).map(|_| s)) {
            Ok(signed) => signed,
            Err(reason) => {
                record_rejection(&audit, &path, &reason, None);
                return Err(Error::CalibrationRejected(reason));
            }
        };

        tracing::info!(
            "Loaded calibration {} from {:?}",
            signed.coefficients.describe(),
            path
        );
        audit.append(
            AuditEvent::new(AuditEventType::CalibrationLoaded, Outcome::Success)
                .detail("after", signed.coefficients.describe())
                .detail("source", path.display().to_string()),
        )?;

        Ok(Self {
            path,
            key,
            active: RwLock::new(Arc::new(signed.coefficients)),
            audit,
        })
    }

    /// The current coefficient snapshot
    pub fn snapshot(&self) -> Arc<CalibrationCoefficients> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Reload from the configured path
    pub fn reload(&self) -> Result<Arc<CalibrationCoefficients>> {
        let path = self.path.clone();
        self.reload_from(&path)
    }

    /// Verify `path` and, if valid, publish it as the new snapshot.
    ///
    /// On any failure the previous snapshot stays active and a critical audit
    /// entry records the rejected attempt.
    pub fn reload_from(&self, path: &Path) -> Result<Arc<CalibrationCoefficients>> {
        let before = self.snapshot();

        let signed = match read_signed(path).and_then(|s| verify(&s, &self.key).map(|_| s)) {
            Ok(signed) => signed,
            Err(reason) => {
                record_rejection(&self.audit, path, &reason, Some(&before));
                return Err(Error::CalibrationRejected(reason));
            }
        };

        let after = Arc::new(signed.coefficients);
        {
            let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::clone(&after);
        }

        tracing::info!(
            "Calibration updated: {} -> {}",
            before.describe(),
            after.describe()
        );
        self.audit.append(
            AuditEvent::new(AuditEventType::CalibrationUpdated, Outcome::Success)
                .detail("before", before.describe())
                .detail("after", after.describe())
                .detail("source", path.display().to_string()),
        )?;

        Ok(after)
    }
}

fn record_rejection(
    audit: &AuditTrail,
    path: &Path,
    reason: &str,
    retained: Option<&CalibrationCoefficients>,
) {
    tracing::error!("Rejected calibration file {:?}: {}", path, reason);

    let mut event = AuditEvent::new(AuditEventType::CalibrationRejected, Outcome::Failure)
        .severity(Severity::Critical)
        .detail("reason", reason)
        .detail("source", path.display().to_string());
    if let Some(retained) = retained {
        event = event.detail("retained", retained.describe());
    }
    if let Err(e) = audit.append(event) {
        tracing::error!("Failed to audit calibration rejection: {}", e);
    }
}
