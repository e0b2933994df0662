//! CLI integration tests for nibble-reconcile.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and end-to-end runs over JSON datasets.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the nibble-reconcile binary.
fn cmd() -> Command {
    Command::cargo_bin("nibble-reconcile").unwrap()
}

/// Write master/slave datasets and a config into `dir`, returning the
/// config path.
fn write_fixture(dir: &Path, options: &str) -> PathBuf {
    let master = dir.join("master.json");
    let slave = dir.join("slave.json");
    fs::write(&master, r#"{"1": "hello", "2": "hello", "3": {"a": 1}, "5": "five"}"#).unwrap();
    fs::write(&slave, r#"{"1": "hello", "2": "changed", "4": "extra", "5": "five"}"#).unwrap();

    let config = dir.join("config.yaml");
    let yaml = format!(
        "job_name: fixture\njob_id: fixture-job\nmaster:\n  path: {}\nslave:\n  path: {}\noptions:\n{}\nretry:\n  max_attempts: 1\n",
        master.display(),
        slave.display(),
        options
    );
    fs::write(&config, yaml).unwrap();
    config
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("windows"))
        .stdout(predicate::str::contains("sample"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--reverse"))
        .stdout(predicate::str::contains("--no-delete"))
        .stdout(predicate::str::contains("--limit"))
        .stdout(predicate::str::contains("--max-limit"))
        .stdout(predicate::str::contains("--max-duration"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nibble-reconcile"));
}

#[test]
fn test_sample_requires_ids() {
    cmd().arg("sample").assert().failure();
}

// =============================================================================
// Error Handling Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config", "/nonexistent/config.yaml", "validate"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_options_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 5");

    cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("max_limit"));
}

#[test]
fn test_limit_override_is_validated() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 4\n  max_limit: 2");

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["run", "--limit", "1"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_missing_dataset_is_connection_error() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 2");
    fs::remove_file(dir.path().join("slave.json")).unwrap();

    cmd()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("Connection error"));
}

// =============================================================================
// End-to-end Tests
// =============================================================================

#[test]
fn test_validate_prints_summary() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 2");

    cmd()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("fixture-job"));
}

#[test]
fn test_run_deletes_extras_and_writes_back() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  should_delete: true\n  limit: 2\n  max_limit: 1");

    let output = cmd()
        .arg("--config")
        .arg(&config)
        .args(["--output-json", "run"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"], "completed");
    assert_eq!(report["job_id"], "fixture-job");
    assert_eq!(report["totals"]["correct"], 2);
    assert_eq!(report["totals"]["incorrect"], 1);
    assert_eq!(report["totals"]["missing"], 1);
    assert_eq!(report["totals"]["extra"], 1);
    assert_eq!(report["totals"]["deleted"], 1);

    let slave = read_json(&dir.path().join("slave.json"));
    assert!(slave.get("4").is_none());
    assert_eq!(slave["2"], "changed");
}

#[test]
fn test_run_no_delete_leaves_slave_untouched() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  should_delete: true\n  limit: 2\n  max_limit: 1");
    let before = fs::read_to_string(dir.path().join("slave.json")).unwrap();

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["run", "--no-delete", "--reverse"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reconciliation completed!"))
        .stdout(predicate::str::contains("Extra: 1"))
        .stdout(predicate::str::contains("Deleted: 0"));

    let after = fs::read_to_string(dir.path().join("slave.json")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_run_writes_checkpoint_file() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 2");
    let checkpoint = dir.path().join("checkpoint.json");
    let mut yaml = fs::read_to_string(&config).unwrap();
    yaml.push_str(&format!("checkpoint_file: {}\n", checkpoint.display()));
    fs::write(&config, yaml).unwrap();

    cmd().arg("--config").arg(&config).arg("run").assert().success();

    let state = read_json(&checkpoint);
    assert!(state["jobs"]["fixture-job"]["position"].is_null());
    assert!(state["hmac"].is_string());
}

#[test]
fn test_windows_lists_scan_partition() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 1");

    let output = cmd()
        .arg("--config")
        .arg(&config)
        .args(["--output-json", "windows"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let windows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let windows = windows.as_array().unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0]["range"], "[1, 3)");
    assert_eq!(windows[0]["next"], 3);
    assert_eq!(windows[1]["range"], "[3, 5]");
    assert!(windows[1]["next"].is_null());
}

#[test]
fn test_sample_classifies_ids() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 1");

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["sample", "1", "2", "3", "4", "9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1: correct"))
        .stdout(predicate::str::contains("2: incorrect"))
        .stdout(predicate::str::contains("3: missing"))
        .stdout(predicate::str::contains("4: extra"))
        .stdout(predicate::str::contains("9: absent"));
}

#[test]
fn test_windows_cover_slave_keys_beyond_master() {
    let dir = TempDir::new().unwrap();
    let config = write_fixture(dir.path(), "  limit: 2\n  max_limit: 1");
    fs::write(dir.path().join("slave.json"), r#"{"1": "hello", "9": "extra"}"#).unwrap();

    let output = cmd()
        .arg("--config")
        .arg(&config)
        .args(["--output-json", "windows"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let windows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let windows = windows.as_array().unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0]["range"], "[1, 3)");
    assert_eq!(windows[1]["range"], "[3, 9]");
}
