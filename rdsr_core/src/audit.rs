//! Append-only, hash-chained audit trail.
//!
//! Entries are stored one per line (JSON Lines) with an exclusive file lock
//! held for each append. Every entry commits to its predecessor:
//!
//! ```text
//! entry[0].previousHash = SHA256("")
//! entry[n].previousHash = SHA256(canonical(entry[n-1]))
//! ```
//!
//! The canonical form is the compact JSON of a fixed, versioned field list
//! (see [`CanonicalEntry`]). It excludes the stored `hash` field and must
//! never change for version 1 entries.
//!
//! There is no update or delete operation. A trail assumes it is the only
//! writer of its log file.

use crate::{Error, Result, StudyKey};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CANONICAL_VERSION: u32 = 1;

/// Kind of pipeline event being recorded
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExposureRecorded,
    ExposureHeld,
    ExposureAssociated,
    ExposureRejected,
    ThresholdExceeded,
    StudyOpened,
    StudyClosed,
    ReportBuilt,
    ReportBuildFailed,
    ExportQueued,
    ExportDelivered,
    ExportRetryScheduled,
    ExportFailed,
    ExportRequeued,
    CalibrationLoaded,
    CalibrationUpdated,
    CalibrationRejected,
    LedgerRecovered,
    QueueRecovered,
    ChainVerified,
    ChainBreakDetected,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

/// An event to be appended; the trail assigns id, timestamp and hashes
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub outcome: Outcome,
    pub severity: Severity,
    pub study_id: Option<String>,
    pub patient_id: Option<String>,
    pub detail: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, outcome: Outcome) -> Self {
        Self {
            event_type,
            outcome,
            severity: Severity::Info,
            study_id: None,
            patient_id: None,
            detail: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn study(mut self, key: &StudyKey) -> Self {
        self.study_id = Some(key.study_id.clone());
        self.patient_id = Some(key.patient_id.clone());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// A persisted audit log line
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: u64,
    pub event_type: AuditEventType,
    pub timestamp_ms: i64,
    pub study_id: Option<String>,
    pub patient_id: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
    pub previous_hash: String,
    pub hash: String,
}

/// Hash input for an entry, version 1
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    v: u32,
    id: u64,
    event_type: AuditEventType,
    timestamp_ms: i64,
    study_id: Option<&'a str>,
    patient_id: Option<&'a str>,
    outcome: Outcome,
    severity: Severity,
    detail: &'a BTreeMap<String, String>,
    previous_hash: &'a str,
}

impl AuditEntry {
    /// SHA-256 of the canonical serialization, hex encoded
    pub fn content_hash(&self) -> Result<String> {
        let canonical = CanonicalEntry {
            v: CANONICAL_VERSION,
            id: self.id,
            event_type: self.event_type,
            timestamp_ms: self.timestamp_ms,
            study_id: self.study_id.as_deref(),
            patient_id: self.patient_id.as_deref(),
            outcome: self.outcome,
            severity: self.severity,
            detail: &self.detail,
            previous_hash: &self.previous_hash,
        };
        Ok(sha256_hex(&serde_json::to_vec(&canonical)?))
    }
}

/// `previousHash` of the first entry
pub fn genesis_hash() -> String {
    sha256_hex(b"")
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Result of walking the chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainStatus {
    Intact,
    Broken { index: usize, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainReport {
    /// Number of lines examined
    pub entries: usize,
    pub status: ChainStatus,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.status == ChainStatus::Intact
    }

    /// Entries before the tamper point
    pub fn intact_entries(&self) -> usize {
        match &self.status {
            ChainStatus::Intact => self.entries,
            ChainStatus::Broken { index, .. } => *index,
        }
    }

    pub fn into_result(self) -> Result<ChainReport> {
        match &self.status {
            ChainStatus::Intact => Ok(self),
            ChainStatus::Broken { index, reason } => Err(Error::Integrity {
                index: *index,
                reason: reason.clone(),
            }),
        }
    }
}

struct ChainTail {
    next_id: u64,
    last_hash: String,
}

/// Append-only audit log
pub struct AuditTrail {
    path: PathBuf,
    tail: Mutex<ChainTail>,
}

impl AuditTrail {
    /// Open (or create) the log and position the chain after its last entry
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repair_partial_tail(&path)?;

        let entries = read_entries(&path)?;
        let tail = match entries.last() {
            Some(last) => ChainTail {
                next_id: last.id + 1,
                last_hash: last.content_hash()?,
            },
            None => ChainTail {
                next_id: 0,
                last_hash: genesis_hash(),
            },
        };

        tracing::debug!("Opened audit trail {:?} at entry {}", path, tail.next_id);
        Ok(Self {
            path,
            tail: Mutex::new(tail),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event, chaining it to the last entry
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());

        let mut entry = AuditEntry {
            id: tail.next_id,
            event_type: event.event_type,
            timestamp_ms: Utc::now().timestamp_millis(),
            study_id: event.study_id,
            patient_id: event.patient_id,
            outcome: event.outcome,
            severity: event.severity,
            detail: event.detail,
            previous_hash: tail.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.content_hash()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let written = write_line(&file, &entry);
        file.unlock()?;
        written?;

        tail.next_id += 1;
        tail.last_hash = entry.hash.clone();

        tracing::debug!("Audit #{} {:?} {:?}", entry.id, entry.event_type, entry.outcome);
        Ok(entry)
    }

    /// All readable entries in order
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        read_entries(&self.path)
    }

    /// Walk the chain from the first entry and report the first break.
    ///
    /// An entry whose own content no longer matches its stored hash is the
    /// tamper point. When an entry is self-consistent but its predecessor's
    /// recomputed hash differs from its `previousHash`, the predecessor was
    /// rewritten and is reported instead.
    ///
    /// Limits: the chain alone cannot tell which side of such a link was
    /// changed. If entry k's `previousHash` is forged and its own hash
    /// recomputed, entry k-1 is reported even though it is unchanged; the
    /// reason names both entries. A rewritten last entry with a recomputed
    /// hash is not detectable without an anchor kept outside the log.
    pub fn verify(&self) -> Result<ChainReport> {
        if !self.path.exists() {
            return Ok(ChainReport {
                entries: 0,
                status: ChainStatus::Intact,
            });
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;
        let lines: std::io::Result<Vec<String>> = BufReader::new(&file).lines().collect();
        file.unlock()?;
        let lines = lines?;

        let mut expected_previous = genesis_hash();
        let mut status = ChainStatus::Intact;

        for (index, line) in lines.iter().enumerate() {
            let entry = match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entry,
                Err(e) => {
                    status = broken(index, format!("unreadable entry: {}", e));
                    break;
                }
            };

            if entry.id != index as u64 {
                status = broken(index, format!("expected sequence id {}, found {}", index, entry.id));
                break;
            }

            let recomputed = entry.content_hash()?;
            if recomputed != entry.hash {
                status = broken(index, "entry content does not match its hash".into());
                break;
            }

            if entry.previous_hash != expected_previous {
                status = if index == 0 {
                    broken(0, "first entry does not start from the genesis hash".into())
                } else {
                    broken(
                        index - 1,
                        format!(
                            "link to entry {} broken: entry {} or the previous hash recorded by entry {} was altered",
                            index,
                            index - 1,
                            index
                        ),
                    )
                };
                break;
            }

            expected_previous = recomputed;
        }

        let report = ChainReport {
            entries: lines.len(),
            status,
        };
        if let ChainStatus::Broken { index, reason } = &report.status {
            tracing::error!(
                "CRITICAL: audit chain {:?} broken at entry {} ({}); {} entries intact",
                self.path,
                index,
                reason,
                report.intact_entries()
            );
        }
        Ok(report)
    }

    /// Verify and record the finding in the trail itself
    pub fn verify_and_record(&self) -> Result<ChainReport> {
        let report = self.verify()?;
        let event = match &report.status {
            ChainStatus::Intact => AuditEvent::new(AuditEventType::ChainVerified, Outcome::Success)
                .detail("entries", report.entries.to_string()),
            ChainStatus::Broken { index, reason } => {
                AuditEvent::new(AuditEventType::ChainBreakDetected, Outcome::Failure)
                    .severity(Severity::Critical)
                    .detail("index", index.to_string())
                    .detail("reason", reason.clone())
                    .detail("intact_entries", report.intact_entries().to_string())
            }
        };
        self.append(event)?;
        Ok(report)
    }
}

fn broken(index: usize, reason: String) -> ChainStatus {
    ChainStatus::Broken { index, reason }
}

fn write_line(file: &File, entry: &AuditEntry) -> Result<()> {
    let mut writer = std::io::BufWriter::new(file);
    let line = serde_json::to_string(entry)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    drop(writer);
    file.sync_data()?;
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let mut entries = Vec::new();
    for (line_num, line_result) in BufReader::new(&file).lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Unreadable audit entry at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    Ok(entries)
}

/// Cut off a trailing line that lacks its newline (an interrupted append).
fn repair_partial_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let contents = std::fs::read(path)?;
    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }

    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    tracing::warn!(
        "Discarding {} bytes of an interrupted audit append in {:?}",
        contents.len() - keep,
        path
    );

    let file = OpenOptions::new().write(true).open(path)?;
    file.lock_exclusive()?;
    let truncated = file.set_len(keep as u64).and_then(|_| file.sync_all());
    file.unlock()?;
    truncated?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trail_with(n: usize) -> (tempfile::TempDir, AuditTrail) {
        let temp_dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(temp_dir.path().join("audit.log")).unwrap();
        let key = StudyKey::new("S1", "P1");
        for i in 0..n {
            trail
                .append(
                    AuditEvent::new(AuditEventType::ExposureRecorded, Outcome::Success)
                        .study(&key)
                        .detail("seq", i.to_string()),
                )
                .unwrap();
        }
        (temp_dir, trail)
    }

    fn rewrite_line(path: &Path, index: usize, f: impl FnOnce(&mut AuditEntry)) {
        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(String::from).collect();
        let mut entry: AuditEntry = serde_json::from_str(&lines[index]).unwrap();
        f(&mut entry);
        lines[index] = serde_json::to_string(&entry).unwrap();
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_first_entry_chains_from_genesis() {
        let (_dir, trail) = trail_with(2);
        let entries = trail.entries().unwrap();
        assert_eq!(entries[0].previous_hash, genesis_hash());
        assert_eq!(
            genesis_hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(entries[1].previous_hash, entries[0].content_hash().unwrap());
        assert_eq!(entries[1].id, 1);
    }

    #[test]
    fn test_unmodified_log_is_intact() {
        let (_dir, trail) = trail_with(10);
        for _ in 0..3 {
            let report = trail.verify().unwrap();
            assert!(report.is_intact());
            assert_eq!(report.entries, 10);
            assert_eq!(report.intact_entries(), 10);
        }
    }

    #[test]
    fn test_mutated_entry_reported_exactly() {
        for k in [0, 3, 9] {
            let (_dir, trail) = trail_with(10);
            rewrite_line(trail.path(), k, |e| e.outcome = Outcome::Failure);

            let report = trail.verify().unwrap();
            assert!(matches!(report.status, ChainStatus::Broken { index, .. } if index == k));
            assert_eq!(report.intact_entries(), k);
        }
    }

    #[test]
    fn test_rewritten_entry_with_recomputed_hash_still_detected() {
        let (_dir, trail) = trail_with(6);
        rewrite_line(trail.path(), 2, |e| {
            e.detail.insert("seq".into(), "forged".into());
            e.hash = e.content_hash().unwrap();
        });

        let report = trail.verify().unwrap();
        assert!(matches!(report.status, ChainStatus::Broken { index: 2, .. }));
    }

    #[test]
    fn test_forged_previous_hash_reports_the_link() {
        let (_dir, trail) = trail_with(6);
        rewrite_line(trail.path(), 3, |e| {
            e.previous_hash = genesis_hash();
            e.hash = e.content_hash().unwrap();
        });

        let report = trail.verify().unwrap();
        match report.status {
            ChainStatus::Broken { index, reason } => {
                assert_eq!(index, 2);
                assert!(reason.contains("entry 2"));
                assert!(reason.contains("entry 3"));
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_deleted_entry_detected() {
        let (_dir, trail) = trail_with(5);
        let contents = std::fs::read_to_string(trail.path()).unwrap();
        let kept: Vec<&str> = contents
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 2)
            .map(|(_, l)| l)
            .collect();
        std::fs::write(trail.path(), kept.join("\n") + "\n").unwrap();

        let report = trail.verify().unwrap();
        assert!(matches!(report.status, ChainStatus::Broken { index: 2, .. }));
        assert!(trail.verify().unwrap().into_result().is_err());
    }

    #[test]
    fn test_reopen_continues_chain() {
        let (dir, trail) = trail_with(3);
        let path = trail.path().to_path_buf();
        drop(trail);

        let reopened = AuditTrail::open(&path).unwrap();
        let entry = reopened
            .append(AuditEvent::new(AuditEventType::StudyClosed, Outcome::Success))
            .unwrap();
        assert_eq!(entry.id, 3);
        assert!(reopened.verify().unwrap().is_intact());
        drop(dir);
    }

    #[test]
    fn test_interrupted_append_is_trimmed_on_open() {
        let (_dir, trail) = trail_with(2);
        let path = trail.path().to_path_buf();
        drop(trail);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, r#"{{"id":2,"eventType":"expo"#).unwrap();
        drop(file);

        let reopened = AuditTrail::open(&path).unwrap();
        assert!(reopened.verify().unwrap().is_intact());
        reopened
            .append(AuditEvent::new(AuditEventType::StudyOpened, Outcome::Success))
            .unwrap();
        assert_eq!(reopened.verify().unwrap().entries, 3);
    }

    #[test]
    fn test_verify_and_record_marks_break_as_critical() {
        let (_dir, trail) = trail_with(4);
        rewrite_line(trail.path(), 1, |e| e.timestamp_ms += 1);

        let report = trail.verify_and_record().unwrap();
        assert!(!report.is_intact());

        let last = trail.entries().unwrap().pop().unwrap();
        assert_eq!(last.event_type, AuditEventType::ChainBreakDetected);
        assert_eq!(last.severity, Severity::Critical);
        assert_eq!(last.detail["index"], "1");
    }
}
