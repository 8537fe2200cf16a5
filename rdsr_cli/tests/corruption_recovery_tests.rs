//! Corruption recovery tests for the rdsr binary.
//!
//! These tests verify the system can handle:
//! - Temporary dose-record artifacts left by a crash before promotion
//! - Truncated temporary artifacts from a crash mid-write
//! - External tampering with the audit log
//! - A partial trailing audit line

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup_env() -> (TempDir, PathBuf, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = temp_dir.path().join("config.toml");
    let data_dir = temp_dir.path().join("data");
    cli(&config, &data_dir).arg("init").assert().success();
    (temp_dir, config, data_dir)
}

fn cli(config: &Path, data_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("rdsr"));
    cmd.env_remove("RDSR_CALIBRATION_KEY")
        .arg("--config")
        .arg(config)
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn run_study(config: &Path, data_dir: &Path, exposures: usize) {
    let mut cmd = cli(config, data_dir);
    cmd.args(["study", "run", "--study", "S1", "--patient", "P1"])
        .args(["--exam-type", "chest_pa", "--no-dispatch"]);
    for _ in 0..exposures {
        cmd.args(["--exposure", "80,4,110,300,300"]);
    }
    cmd.assert().success();
}

fn record_files(data_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(data_dir.join("ledger/records"))
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "json"))
        .collect();
    files.sort();
    files
}

fn tmp_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.to_string_lossy().ends_with(".tmp"))
        .collect()
}

#[test]
fn test_complete_temp_record_is_promoted() {
    let (_temp_dir, config, data_dir) = setup_env();
    run_study(&config, &data_dir, 1);

    // Crash after the temporary artifact was fully written, before rename
    let final_path = record_files(&data_dir).remove(0);
    let contents = fs::read(&final_path).unwrap();
    fs::remove_file(&final_path).unwrap();
    fs::write(data_dir.join("ledger/records/.crash123.tmp"), &contents).unwrap();

    cli(&config, &data_dir)
        .arg("recover")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger: 1 promoted, 0 discarded"));

    assert_eq!(fs::read(&final_path).unwrap(), contents);
    assert!(tmp_files(&data_dir.join("ledger/records")).is_empty());
}

#[test]
fn test_truncated_temp_record_is_discarded() {
    let (_temp_dir, config, data_dir) = setup_env();
    run_study(&config, &data_dir, 1);

    let contents = fs::read(record_files(&data_dir).remove(0)).unwrap();
    let mut partial = fs::File::create(data_dir.join("ledger/records/.crash456.tmp")).unwrap();
    partial.write_all(&contents[..contents.len() / 2]).unwrap();
    drop(partial);

    cli(&config, &data_dir)
        .arg("recover")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger: 0 promoted, 1 discarded"));

    // The original record is untouched and no partial record appeared
    assert_eq!(record_files(&data_dir).len(), 1);
    assert!(tmp_files(&data_dir.join("ledger/records")).is_empty());
}

#[test]
fn test_any_command_runs_recovery_first() {
    let (_temp_dir, config, data_dir) = setup_env();
    fs::create_dir_all(data_dir.join("ledger/records")).unwrap();
    fs::write(data_dir.join("ledger/records/.junk.tmp"), "{ invalid json").unwrap();

    cli(&config, &data_dir).args(["queue", "list"]).assert().success();
    assert!(tmp_files(&data_dir.join("ledger/records")).is_empty());
}

#[test]
fn test_tampered_audit_entry_detected() {
    let (_temp_dir, config, data_dir) = setup_env();
    run_study(&config, &data_dir, 2);

    let log_path = data_dir.join("audit/audit.log");
    let log = fs::read_to_string(&log_path).unwrap();
    let mut lines: Vec<String> = log.lines().map(String::from).collect();
    assert!(lines.len() > 5);

    let mut entry: serde_json::Value = serde_json::from_str(&lines[4]).unwrap();
    entry["outcome"] = serde_json::Value::from("failure");
    lines[4] = entry.to_string();
    fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    cli(&config, &data_dir)
        .args(["audit", "verify"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("BROKEN at entry 4"))
        .stdout(predicate::str::contains("Entries before 4 are intact"));

    // The finding itself is recorded at critical severity
    let log = fs::read_to_string(&log_path).unwrap();
    let last: serde_json::Value = serde_json::from_str(log.lines().last().unwrap()).unwrap();
    assert_eq!(last["eventType"], "chain_break_detected");
    assert_eq!(last["severity"], "critical");
}

#[test]
fn test_deleted_audit_entry_detected() {
    let (_temp_dir, config, data_dir) = setup_env();
    run_study(&config, &data_dir, 2);

    let log_path = data_dir.join("audit/audit.log");
    let log = fs::read_to_string(&log_path).unwrap();
    let mut lines: Vec<&str> = log.lines().collect();
    lines.remove(3);
    fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    cli(&config, &data_dir)
        .args(["audit", "verify"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("BROKEN at entry 3"));
}

#[test]
fn test_partial_trailing_audit_line_is_repaired() {
    let (_temp_dir, config, data_dir) = setup_env();
    run_study(&config, &data_dir, 1);

    let log_path = data_dir.join("audit/audit.log");
    let mut file = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(b"{\"id\":999,\"eventType\":\"expo").unwrap();
    drop(file);

    cli(&config, &data_dir)
        .args(["audit", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Audit chain intact"));
}
