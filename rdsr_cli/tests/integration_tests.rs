//! Integration tests for the rdsr binary.
//!
//! These tests verify end-to-end behavior including:
//! - Setup of config and signed calibration
//! - The study pipeline from exposures to a delivered report
//! - Advisory threshold reporting
//! - CSV export of the dose ledger

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A config file and data directory inside one temp dir
struct TestEnv {
    _temp_dir: TempDir,
    config: PathBuf,
    data_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = temp_dir.path().join("config.toml");
        let data_dir = temp_dir.path().join("data");
        let env = Self {
            _temp_dir: temp_dir,
            config,
            data_dir,
        };
        env.rdsr().arg("init").assert().success();
        env
    }

    /// Command with this environment's config and data dir
    fn rdsr(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("rdsr"));
        cmd.env_remove("RDSR_CALIBRATION_KEY")
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config)
            .arg("--data-dir")
            .arg(&self.data_dir);
        cmd
    }

    fn edit_config(&self, f: impl FnOnce(String) -> String) {
        let contents = fs::read_to_string(&self.config).unwrap();
        fs::write(&self.config, f(contents)).unwrap();
    }

    fn audit_log(&self) -> String {
        fs::read_to_string(self.data_dir.join("audit/audit.log")).unwrap()
    }
}

fn run_chest_study(env: &TestEnv, study: &str, exposures: &[&str]) -> assert_cmd::assert::Assert {
    let mut cmd = env.rdsr();
    cmd.args(["study", "run", "--study", study, "--patient", "P1"])
        .args(["--patient-name", "DOE^JANE", "--exam-type", "chest_pa"]);
    for exposure in exposures {
        cmd.arg("--exposure").arg(exposure);
    }
    cmd.assert()
}

#[test]
fn test_cli_help() {
    Command::new(assert_cmd::cargo::cargo_bin!("rdsr"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Radiation dose capture, audit and dose report export",
        ));
}

#[test]
fn test_init_writes_config_and_calibration() {
    let env = TestEnv::new();

    assert!(env.config.exists());
    let calibration = fs::read_to_string(env.data_dir.join("calibration.toml")).unwrap();
    assert!(calibration.contains("[coefficients]"));
    assert!(calibration.contains("hmac-sha256"));

    let config = fs::read_to_string(&env.config).unwrap();
    assert!(config.contains("signing_key"));

    // A second init refuses to overwrite
    env.rdsr().arg("init").assert().failure();
    env.rdsr().args(["init", "--force"]).assert().success();
}

#[test]
fn test_study_run_records_and_delivers_report() {
    let env = TestEnv::new();

    run_chest_study(&env, "S1", &["80,4,110,300,300", "80,4,110,300,300"])
        .success()
        .stdout(predicate::str::contains("Exposures:  2"))
        .stdout(predicate::str::contains("Total DAP:  416.920751"))
        .stdout(predicate::str::contains("Threshold:  not exceeded"))
        .stdout(predicate::str::contains("(complete)"));

    let records: Vec<_> = fs::read_dir(env.data_dir.join("ledger/records"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .collect();
    assert_eq!(records.len(), 2);

    // Delivered by the file-drop transport
    let delivered: Vec<_> = fs::read_dir(env.data_dir.join("outbox/PACS"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(delivered.len(), 1);
    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(delivered[0].path()).unwrap()).unwrap();
    assert_eq!(report["sop_class_uid"], "1.2.840.10008.5.1.4.1.1.88.67");
    assert_eq!(report["study_id"], "S1");

    let audit = env.audit_log();
    for event in [
        "study_opened",
        "exposure_recorded",
        "study_closed",
        "report_built",
        "export_queued",
        "export_delivered",
    ] {
        assert!(audit.contains(event), "missing audit event {}", event);
    }

    env.rdsr()
        .args(["audit", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Audit chain intact"));
}

#[test]
fn test_missing_mas_records_exposure_but_builds_no_report() {
    let env = TestEnv::new();

    run_chest_study(&env, "S1", &["80,-,110,300,300"])
        .success()
        .stdout(predicate::str::contains("Exposures:  1"))
        .stdout(predicate::str::contains("not built"));

    let audit = env.audit_log();
    assert!(audit.contains("partial_success"));
    assert!(audit.contains("report_build_failed"));
    assert!(audit.contains("exposure[0].mas"));

    env.rdsr()
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty"));
}

#[test]
fn test_measured_dap_overrides_calculated() {
    let env = TestEnv::new();

    run_chest_study(&env, "S1", &["80,4,110,300,300,0.125"])
        .success()
        .stdout(predicate::str::contains("Total DAP:  0.125000"));
}

#[test]
fn test_reference_level_exceeded_is_advisory() {
    let env = TestEnv::new();
    env.edit_config(|config| format!("{}\n[reference_levels.chest_pa]\ndap = 300.0\n", config));

    run_chest_study(&env, "S1", &["80,4,110,300,300", "80,4,110,300,300"])
        .success()
        .stdout(predicate::str::contains("Exposures:  2"))
        .stdout(predicate::str::contains("Threshold:  exceeded"));

    let audit = env.audit_log();
    assert_eq!(audit.matches("threshold_exceeded\"").count(), 1);
}

#[test]
fn test_invalid_exposure_argument_rejected() {
    let env = TestEnv::new();

    run_chest_study(&env, "S1", &["80,4,110"])
        .failure()
        .stderr(predicate::str::contains("expected kvp,mas"));
}

#[test]
fn test_export_csv() {
    let env = TestEnv::new();
    run_chest_study(&env, "S1", &["80,4,110,300,300"]).success();
    run_chest_study(&env, "S2", &["70,2.5,100,240,300"]).success();

    let out = env.data_dir.join("doses.csv");
    env.rdsr()
        .arg("export-csv")
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 2 records"));

    let csv = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3); // header + 2 records
    assert!(lines[0].contains("exposure_id"));
    assert!(csv.contains("S1"));
    assert!(csv.contains("S2"));
}

#[test]
fn test_calibration_sign_produces_loadable_file() {
    let env = TestEnv::new();
    let out = env.data_dir.join("calibration.toml");

    env.rdsr()
        .args(["calibration", "sign", "--k", "0.024", "--n", "2.5", "--c", "1.02"])
        .args(["--version", "2", "--out"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("v2"));

    // Doubling k doubles the dose
    run_chest_study(&env, "S1", &["80,4,110,300,300"])
        .success()
        .stdout(predicate::str::contains("Total DAP:  416.920751"));
}

#[test]
fn test_tampered_calibration_stops_study() {
    let env = TestEnv::new();
    let path = env.data_dir.join("calibration.toml");
    let contents = fs::read_to_string(&path).unwrap();
    fs::write(&path, contents.replace("k_factor = 0.012", "k_factor = 0.02")).unwrap();

    run_chest_study(&env, "S1", &["80,4,110,300,300"]).failure();

    let audit = env.audit_log();
    assert!(audit.contains("calibration_rejected"));
    assert!(audit.contains("critical"));
}
