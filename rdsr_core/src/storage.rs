//! Atomic file primitives shared by the dose ledger and the export queue.
//!
//! Every artifact is written to a uniquely named `.tmp` sibling, flushed and
//! synced, then promoted with a single rename. A directory-scoped `.lock`
//! file serializes writers across threads and processes.

use crate::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Suffix of in-flight artifacts
pub const TMP_SUFFIX: &str = ".tmp";

const LOCK_FILE: &str = ".lock";

/// Exclusive lock on a storage directory, released on drop
pub struct DirLock {
    file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Serialize `value` into a fresh temporary artifact inside `dir`.
///
/// The returned file is fully written and synced but not yet promoted.
pub fn write_temp_json<T: Serialize>(dir: &Path, value: &T) -> Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(TMP_SUFFIX)
        .tempfile_in(dir)?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// Promote a temporary artifact to `final_path` with one rename.
///
/// With `replace == false` an existing final file is never overwritten.
/// If the rename fails the temporary artifact is kept on disk so that
/// startup recovery can finish the promotion.
pub fn promote(temp: NamedTempFile, final_path: &Path, replace: bool) -> Result<()> {
    let result = if replace {
        temp.persist(final_path)
    } else {
        temp.persist_noclobber(final_path)
    };

    match result {
        Ok(_) => {
            if let Some(parent) = final_path.parent() {
                sync_dir(parent)?;
            }
            Ok(())
        }
        Err(e) => {
            let kept = e.file.keep().ok().map(|(_, path)| path);
            Err(Error::Persistence(format!(
                "failed to promote {:?} (temporary artifact {:?} retained): {}",
                final_path, kept, e.error
            )))
        }
    }
}

/// Write `value` to `final_path` through a temporary artifact in the same directory
pub fn atomic_write_json<T: Serialize>(final_path: &Path, value: &T, replace: bool) -> Result<()> {
    let dir = final_path.parent().ok_or_else(|| {
        Error::Persistence(format!("path {:?} has no parent directory", final_path))
    })?;
    let temp = write_temp_json(dir, value)?;
    promote(temp, final_path, replace)
}

/// Read and deserialize a JSON artifact
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Promoted `.json` artifacts in `dir`, sorted by file name
pub fn list_json(dir: &Path) -> Result<Vec<PathBuf>> {
    list_matching(dir, |name| !name.starts_with('.') && name.ends_with(".json"))
}

/// Orphaned temporary artifacts in `dir`
pub fn temp_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    list_matching(dir, |name| name.ends_with(TMP_SUFFIX))
}

fn list_matching(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(&keep)
            .unwrap_or(false);
        if matches && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Outcome of startup recovery
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Complete temporary artifacts promoted to their final name
    pub promoted: usize,
    /// Truncated, invalid or superseded artifacts removed
    pub discarded: usize,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: RecoveryReport) {
        self.promoted += other.promoted;
        self.discarded += other.discarded;
    }
}

/// Resolve orphaned temporary artifacts in `dir`.
///
/// An artifact that parses completely is renamed to the final path derived
/// from its content, unless that file already exists. Anything else is
/// deleted.
pub fn recover_temp_artifacts<T: DeserializeOwned>(
    dir: &Path,
    final_path_for: impl Fn(&T) -> PathBuf,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for temp_path in temp_artifacts(dir)? {
        match read_json::<T>(&temp_path) {
            Ok(value) => {
                let final_path = final_path_for(&value);
                if final_path.exists() {
                    tracing::warn!(
                        "Final artifact {:?} already present, discarding {:?}",
                        final_path,
                        temp_path
                    );
                    std::fs::remove_file(&temp_path)?;
                    report.discarded += 1;
                } else {
                    std::fs::rename(&temp_path, &final_path)?;
                    tracing::info!("Promoted orphaned artifact to {:?}", final_path);
                    report.promoted += 1;
                }
            }
            Err(e) => {
                tracing::warn!("Discarding incomplete artifact {:?}: {}", temp_path, e);
                std::fs::remove_file(&temp_path)?;
                report.discarded += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("item.json");
        let item = Item {
            id: 7,
            name: "seven".into(),
        };

        atomic_write_json(&path, &item, false).unwrap();

        assert_eq!(read_json::<Item>(&path).unwrap(), item);
        assert!(temp_artifacts(temp_dir.path()).unwrap().is_empty());
        assert_eq!(list_json(temp_dir.path()).unwrap(), vec![path]);
    }

    #[test]
    fn test_noclobber_keeps_original_and_temp() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("item.json");
        let first = Item {
            id: 1,
            name: "first".into(),
        };
        let second = Item {
            id: 2,
            name: "second".into(),
        };

        atomic_write_json(&path, &first, false).unwrap();
        let err = atomic_write_json(&path, &second, false).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));

        assert_eq!(read_json::<Item>(&path).unwrap(), first);
        assert_eq!(temp_artifacts(temp_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_overwrites() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("item.json");

        atomic_write_json(&path, &Item { id: 1, name: "a".into() }, true).unwrap();
        atomic_write_json(&path, &Item { id: 2, name: "b".into() }, true).unwrap();

        assert_eq!(read_json::<Item>(&path).unwrap().id, 2);
    }

    #[test]
    fn test_dir_lock_is_reacquirable() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let _lock = DirLock::acquire(temp_dir.path()).unwrap();
        }
        let _lock = DirLock::acquire(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join(".lock").exists());
        // The lock file is not a data artifact
        assert!(list_json(temp_dir.path()).unwrap().is_empty());
    }
}
