//! Black-box tests over the CLI surface (§6, "ambient CLI surface"). Drives
//! the compiled binary directly so they exercise the same dispatch path a
//! user would, without reaching for network-backed commands (`models pull`,
//! `binary install`) that need a live download.

use assert_cmd::Command;
use predicates::prelude::*;

fn genforge() -> Command {
    Command::cargo_bin("genforge").unwrap()
}

#[test]
fn models_list_on_empty_data_dir_reports_nothing_installed() {
    let dir = tempfile::tempdir().unwrap();
    genforge()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["models", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no models installed"));
}

#[test]
fn models_remove_missing_model_fails_with_model_not_found() {
    let dir = tempfile::tempdir().unwrap();
    genforge()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["models", "remove", "does-not-exist"])
        .assert()
        .failure();
}

#[test]
fn gpu_info_prints_a_json_capability_snapshot() {
    genforge()
        .args(["gpu-info"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cpu\""))
        .stdout(predicate::str::contains("\"memory\""));
}

#[test]
fn binary_status_with_no_cache_reports_not_validated() {
    let dir = tempfile::tempdir().unwrap();
    genforge()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["binary", "status", "diffusion"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no validated binary cached"));
}

#[test]
fn serve_without_config_fails_fast_with_a_clear_message() {
    let dir = tempfile::tempdir().unwrap();
    genforge()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["serve", "--bind", "127.0.0.1:0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}
