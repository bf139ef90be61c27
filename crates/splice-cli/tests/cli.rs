//! Binary-level tests

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn splice() -> Command {
    Command::cargo_bin("splice").unwrap()
}

#[test]
fn test_profiles_listed() {
    splice()
        .args(["config", "profiles"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plaintext"))
        .stdout(predicate::str::contains("passthrough"));
}

#[test]
fn test_generate_then_validate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("splice.toml");

    splice()
        .args(["config", "generate", "-p", "rewrite", "-o"])
        .arg(&path)
        .assert()
        .success();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.starts_with("# splice configuration"));

    splice()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("1 stream"));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[interception]\nports = [0]\n").unwrap();

    splice().args(["config", "validate"]).arg(&path).assert().failure();
}

#[test]
fn test_unknown_profile_rejected() {
    splice()
        .args(["config", "show", "--profile", "nonexistent"])
        .assert()
        .failure();
}

#[test]
fn test_demo_json_report() {
    splice()
        .args(["-q", "demo", "--profile", "plaintext", "--replace", "origin=proxy", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stacks_created\": 1"))
        .stdout(predicate::str::contains("from the proxy server"));
}
