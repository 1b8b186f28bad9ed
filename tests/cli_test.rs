//! CLI Tests
//!
//! Runs the `kumo-uploadr` binary for commands that need no storage service.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn kumo() -> Command {
    let mut cmd = Command::cargo_bin("kumo-uploadr").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_plan_prints_parts() {
    let config = config_file(
        "upload:\n  part_size: 20000000\n  multipart_threshold: 20000000\n",
    );

    let output = kumo()
        .arg("--config")
        .arg(config.path())
        .args(["plan", "50000000"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["object_size"], 50_000_000);
    assert_eq!(plan["single_request"], false);
    assert_eq!(plan["part_size"], 20_000_000);
    assert_eq!(plan["part_count"], 3);
    assert_eq!(plan["parts"][2]["part_number"], 3);
    assert_eq!(plan["parts"][2]["offset"], 40_000_000);
    assert_eq!(plan["parts"][2]["length"], 10_000_000);
}

#[test]
fn test_plan_small_object_is_single_request() {
    let output = kumo().args(["plan", "1024"]).output().unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["single_request"], true);
    assert_eq!(plan["part_count"], 1);
}

#[test]
fn test_plan_empty_object() {
    let output = kumo().args(["plan", "0"]).output().unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["single_request"], true);
    assert_eq!(plan["part_count"], 0);
}

#[test]
fn test_plan_too_large_fails() {
    let config = config_file("upload:\n  max_parts: 1\n");

    kumo()
        .arg("--config")
        .arg(config.path())
        .args(["plan", "6442450944"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_config_rejected() {
    let config = config_file("logging:\n  format: xml\n");

    kumo()
        .arg("--config")
        .arg(config.path())
        .args(["plan", "1024"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log format"));
}

#[test]
fn test_missing_config_file() {
    kumo()
        .args(["--config", "/nonexistent/kumo.yaml", "plan", "1024"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading configuration"));
}

#[test]
fn test_upload_requires_arguments() {
    kumo().args(["upload", "bucket"]).assert().failure();
}
