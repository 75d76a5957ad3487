//! CLI integration tests
//!
//! Tests the vigil CLI using assert_cmd. Every command runs against a
//! temporary config directory with in-memory credentials.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vigil(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vigil")
        .expect("Failed to locate vigil binary - ensure it's built before running tests");
    cmd.env("VIGIL_CONFIG", dir.join("config.toml"))
        .env("VIGIL_SERVERS", dir.join("servers.toml"))
        .env_remove("VIGIL_PASSWORD")
        .env_remove("RUST_LOG")
        .arg("--ephemeral");
    cmd
}

fn write_servers(dir: &TempDir) {
    std::fs::write(
        dir.path().join("servers.toml"),
        r#"
[[server]]
id = "3f2a9c1e-0000-4000-8000-000000000001"
name = "garage"
host = "10.0.0.5"
username = "pi"
has_key_installed = true
host_key = "SHA256:testfingerprint"

[[server]]
id = "7b1d0e4f-0000-4000-8000-000000000002"
name = "attic"
host = "nas.local"
username = "admin"
ssh_port = 2222
"#,
    )
    .unwrap();
}

#[test]
fn test_cli_help() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("vigil"))
        .stdout(predicate::str::contains("Server monitoring client"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vigil"));
}

#[test]
fn test_cli_add_help() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .args(["add", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--password-stdin"))
        .stdout(predicate::str::contains("--agent-port"));
}

#[test]
fn test_cli_unknown_command() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_list_empty() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No servers configured"));
}

#[test]
fn test_cli_list_shows_servers() {
    let dir = tempfile::tempdir().unwrap();
    write_servers(&dir);
    vigil(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("garage"))
        .stdout(predicate::str::contains("pi@10.0.0.5:22"))
        .stdout(predicate::str::contains("admin@nas.local:2222"));

    vigil(dir.path())
        .args(["list", "--long"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SHA256:testfingerprint"));
}

#[test]
fn test_cli_list_json() {
    let dir = tempfile::tempdir().unwrap();
    write_servers(&dir);
    let output = vigil(dir.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let servers: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let servers = servers.as_array().unwrap();
    assert_eq!(servers.len(), 2);
    // Sorted by name
    assert_eq!(servers[0]["name"], "attic");
    assert_eq!(servers[1]["agent_port"], 7654);
}

#[test]
fn test_cli_edit_renames_stopped_server() {
    let dir = tempfile::tempdir().unwrap();
    write_servers(&dir);
    vigil(dir.path())
        .args(["edit", "garage", "--name", "shed"])
        .assert()
        .success();

    let servers = std::fs::read_to_string(dir.path().join("servers.toml")).unwrap();
    assert!(servers.contains("name = \"shed\""));
    assert!(servers.contains("SHA256:testfingerprint"));
}

#[test]
fn test_cli_edit_needs_a_change() {
    let dir = tempfile::tempdir().unwrap();
    write_servers(&dir);
    vigil(dir.path())
        .args(["edit", "garage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to change"));
}

#[test]
fn test_cli_remove_by_id_prefix() {
    let dir = tempfile::tempdir().unwrap();
    write_servers(&dir);
    vigil(dir.path())
        .args(["remove", "7b1d"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed attic"));

    vigil(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("attic").not());
}

#[test]
fn test_cli_remove_unknown_server() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .args(["remove", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No server matches"));
}

#[test]
fn test_cli_add_requires_password_on_stdin() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .args(["add", "127.0.0.1", "-u", "pi", "--password-stdin"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("standard input"));
}

#[test]
fn test_cli_add_unreachable_host_keeps_nothing() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens on port 1
    vigil(dir.path())
        .args(["add", "127.0.0.1", "-u", "pi", "-p", "1", "--password-stdin"])
        .write_stdin("hunter2\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not reach the server"));

    assert!(!dir.path().join("servers.toml").exists());
}

#[test]
fn test_cli_watch_without_servers() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .arg("watch")
        .assert()
        .success()
        .stderr(predicate::str::contains("No servers configured"));
}

#[test]
fn test_cli_config_init_and_show() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("showing defaults"))
        .stdout(predicate::str::contains("key_comment = \"vigil-client\""));

    vigil(dir.path())
        .args(["config", "init"])
        .assert()
        .success();
    assert!(dir.path().join("config.toml").exists());

    vigil(dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("servers.toml"));
}

#[test]
fn test_cli_pin_scope_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    vigil(dir.path())
        .args(["pin", "scope", "3"])
        .assert()
        .success();

    vigil(dir.path())
        .args(["pin", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("window and menu bar"))
        .stdout(predicate::str::contains("PIN set:      no"));

    vigil(dir.path())
        .args(["pin", "scope", "4"])
        .assert()
        .failure();
}
