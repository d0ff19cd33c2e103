//! CLI Tests
//!
//! Runs the binary for argument parsing and startup failures; these exit
//! before the server binds.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Test: --help describes the options
#[test]
fn test_help() {
    Command::cargo_bin("resumable-uploadr")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--log-level"));
}

/// Test: --version prints the crate version
#[test]
fn test_version() {
    Command::cargo_bin("resumable-uploadr")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

/// Test: a missing config file fails startup
#[test]
fn test_missing_config_fails() {
    Command::cargo_bin("resumable-uploadr")
        .unwrap()
        .args(["--config", "/nonexistent/uploadr.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

/// Test: a config with no protocol enabled is rejected
#[test]
fn test_no_protocols_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
server:
  address: "127.0.0.1:0"
metrics:
  enabled: false
protocols:
  tus:
    enabled: false
    path_prefix: "/files"
  uploadx:
    enabled: false
    path_prefix: "/upload"
"#
    )
    .unwrap();

    Command::cargo_bin("resumable-uploadr")
        .unwrap()
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("At least one protocol"));
}
