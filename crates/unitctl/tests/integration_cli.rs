//! Integration tests for the unitctl binary that need no service manager

use assert_cmd::cargo;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_help_lists_every_command() {
    let mut cmd = cargo::cargo_bin_cmd!("unitctl");
    cmd.arg("--help");

    let output = cmd.assert().success().get_output().stdout.clone();
    let help = String::from_utf8(output).unwrap();
    for command in ["start", "stop", "restart", "uptime", "watch", "link", "unlink"] {
        assert!(help.contains(command), "help is missing {command}:\n{help}");
    }
}

#[test]
fn test_unit_name_is_required() {
    let mut cmd = cargo::cargo_bin_cmd!("unitctl");
    cmd.arg("start");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("<UNIT>"));
}

#[test]
fn test_invalid_bus_env_is_reported() {
    let mut cmd = cargo::cargo_bin_cmd!("unitctl");
    cmd.env("UNITCTL_BUS", "carrier-pigeon")
        .args(["uptime", "dummy.service"]);

    cmd.assert()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"))
        .stderr(predicate::str::contains("UNITCTL_BUS"));
}

#[test]
fn test_missing_explicit_config_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let mut cmd = cargo::cargo_bin_cmd!("unitctl");
    cmd.env_remove("UNITCTL_BUS")
        .arg("--config")
        .arg(&missing)
        .args(["stop", "dummy.service"]);

    cmd.assert()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"))
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn test_malformed_explicit_config_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(&config, "[bus]\nkind = 42\n").unwrap();

    let mut cmd = cargo::cargo_bin_cmd!("unitctl");
    cmd.env_remove("UNITCTL_BUS")
        .arg("--config")
        .arg(&config)
        .args(["restart", "dummy.service"]);

    cmd.assert()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"));
}
