//! Smoke tests -- verify the binary runs and the one-shot commands work.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write a config pointing at a database inside `dir`.
fn config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("pulsewarden.toml");
    let db = dir.path().join("pulsewarden.db");
    std::fs::write(
        &path,
        format!("[storage]\ndatabase_path = {:?}\n\n[logging]\nlevel = \"warn\"\n", db.to_string_lossy()),
    )
    .unwrap();
    path
}

fn cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pulsewarden").unwrap();
    cmd.arg("--config").arg(config(dir));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("pulsewarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Metric anomaly detection"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("pulsewarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pulsewarden"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["evaluate", "--help"],
        vec!["thresholds", "list", "--help"],
        vec!["anomalies", "ack", "--help"],
        vec!["incidents", "timeline", "--help"],
    ] {
        Command::cargo_bin("pulsewarden")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_seed_then_list_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    cmd(&dir).args(["thresholds", "seed"]).assert().success();
    cmd(&dir)
        .args(["thresholds", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CPU_USAGE"))
        .stdout(predicate::str::contains("95.0"));
}

#[test]
fn test_evaluate_file_opens_incident() {
    let dir = tempfile::tempdir().unwrap();
    let sample = dir.path().join("sample.json");
    std::fs::write(
        &sample,
        r#"{
            "application_id": "6f1c2d3e-4a5b-4c6d-8e7f-9a0b1c2d3e4f",
            "application_name": "checkout",
            "metric_type": "ERROR_COUNT",
            "metric_name": "http_5xx",
            "value": 60
        }"#,
    )
    .unwrap();

    cmd(&dir)
        .arg("evaluate")
        .arg("--file")
        .arg(&sample)
        .assert()
        .success()
        .stdout(predicate::str::contains("CRITICAL"))
        .stdout(predicate::str::contains("INC-000001"));

    cmd(&dir)
        .args(["incidents", "status", "INC-000001", "ACKNOWLEDGED"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ACKNOWLEDGED"));

    cmd(&dir)
        .args(["incidents", "timeline", "INC-000001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CREATED"))
        .stdout(predicate::str::contains("STATUS_CHANGED"));
}

#[test]
fn test_unknown_incident_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd(&dir)
        .args(["incidents", "show", "INC-999999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_broken_env_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[storage\ndatabase_path = ").unwrap();

    Command::cargo_bin("pulsewarden")
        .unwrap()
        .current_dir(dir.path())
        .env("PULSEWARDEN_CONFIG", &broken)
        .env_remove("RUST_LOG")
        .args(["thresholds", "list"])
        .assert()
        .success()
        .stderr(predicate::str::contains("could not be loaded"));
}
