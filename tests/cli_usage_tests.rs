//! Binary-level CLI behavior
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_missing_command_is_usage_error() {
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("missing command"));
}

#[test]
fn test_preflight_missing_command_is_usage_error() {
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.arg("preflight")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing install command"));
}

#[test]
fn test_help_mentions_modes() {
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("preflight"))
        .stdout(predicate::str::contains("sandbox"));
}

#[test]
fn test_observed_run_propagates_exit_code() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.current_dir(dir.path())
        .args(["--", "sh", "-c", "exit 5"])
        .assert()
        .code(5);
}

#[test]
fn test_observed_run_emits_summary_and_csv() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.current_dir(dir.path())
        .args(["--log", "events.jsonl", "--", "sh", "-c", "exit 0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("events:"));
    assert!(dir.path().join("events.csv").exists());
    // the bootstrap for the early hook landed in the run directory
    assert!(dir.path().join(".npm-malwatch/bootstrap.cjs").exists());
}

#[test]
fn test_observed_launch_failure_exits_one() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.current_dir(dir.path())
        .args(["--", "/no/such/binary-xyz"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to launch"));
}

#[test]
fn test_preflight_run_writes_report() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("package.json"), "{\"name\":\"p\"}").unwrap();
    let mut cmd = Command::cargo_bin("npm-malwatch").unwrap();
    cmd.current_dir(dir.path())
        .args([
            "preflight",
            "--report",
            "report.json",
            "--",
            "sh",
            "-c",
            "exit 0",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("report:"));
    let report = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    assert!(report.contains("\"packagesWithScripts\": 0"));
    assert!(dir.path().join("report.csv").exists());
}
