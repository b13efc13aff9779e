mod common;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use std::path::Path;
use std::process::{Command, Output};

/// Integration tests for the portfolio-sync CLI
/// These tests run the actual binary against a temporary config and database

const SECRET_VARS: [&str; 5] = [
    "PORTFOLIO_ENCRYPTION_SECRET",
    "CRON_SECRET",
    "PORTFOLIO_DATABASE",
    "GITHUB_TOKEN",
    "RUST_LOG",
];

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_portfolio-sync"));
    for var in SECRET_VARS {
        command.env_remove(var);
    }
    command
}

fn run_with_config(config: &Path, args: &[&str]) -> Output {
    cli()
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_cli_help() {
    let output = cli().arg("--help").output().expect("Failed to execute command");

    assert!(output.status.success());
    common::assert_contains_all(
        &stdout(&output),
        &[
            "init", "connect", "disconnect", "status", "repos", "import", "projects", "sync",
            "serve", "daemon", "doctor",
        ],
    );
}

#[test]
fn test_cli_version() {
    let output = cli().arg("--version").output().expect("Failed to execute command");

    assert!(output.status.success());
    assert!(predicate::str::contains("portfolio-sync").eval(&stdout(&output)));
}

#[test]
fn test_init_writes_config_once() {
    let temp = TempDir::new().unwrap();
    let config = temp.child("nested").child("config.yml");

    let output = run_with_config(config.path(), &["init"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    config.assert(predicate::path::is_file());
    config.assert(predicate::str::contains("database_path"));
    config.assert(predicate::str::contains("daemon:"));

    let again = run_with_config(config.path(), &["init"]);
    assert!(again.status.success());
    assert!(stdout(&again).contains("already exists"));

    let forced = run_with_config(config.path(), &["init", "--force"]);
    assert!(forced.status.success());
    assert!(stdout(&forced).contains("Configuration written"));
}

#[test]
fn test_status_when_not_connected() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = run_with_config(&config, &["status"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    common::assert_contains_all(&stdout(&output), &["Not connected", "Projects: 0"]);

    let json = run_with_config(&config, &["status", "--json"]);
    assert!(json.status.success());
    let status: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(status["connected"], false);
    assert_eq!(status["projects"], 0);
}

#[test]
fn test_status_counts_projects() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();
    {
        let store = env.open_store();
        store
            .insert_project(&portfolio_sync::store::NewProject::manual("Notes", "A manual project", 1))
            .unwrap();
    }

    let json = run_with_config(&config, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(status["projects"], 1);
    assert_eq!(status["synced_projects"], 0);
}

#[test]
fn test_doctor_requires_encryption_secret() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = run_with_config(&config, &["doctor"]);
    assert!(!output.status.success());
    common::assert_contains_all(&stdout(&output), &["Diagnostics", "Encryption secret missing"]);
}

#[test]
fn test_doctor_passes_with_secret() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = cli()
        .arg("--config")
        .arg(&config)
        .arg("doctor")
        .env("PORTFOLIO_ENCRYPTION_SECRET", "doctor-secret")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success(), "stdout: {}", stdout(&output));
    common::assert_contains_all(&stdout(&output), &["GitHub not connected", "All checks passed"]);
}

#[test]
fn test_sync_without_connection_fails() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = run_with_config(&config, &["sync"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not connected"));
}

#[test]
fn test_connect_refuses_without_secret() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = run_with_config(&config, &["connect", "--token", "gho_example"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Encryption secret is not configured"));
}

#[test]
fn test_project_edit_and_visibility() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();
    let id = env
        .open_store()
        .insert_project(&portfolio_sync::store::NewProject::manual("Notes", "A manual project", 1))
        .unwrap()
        .to_string();

    let empty = run_with_config(&config, &["projects", "edit", &id]);
    assert!(!empty.status.success());
    assert!(stderr(&empty).contains("Nothing to change"));

    let edit = run_with_config(&config, &["projects", "edit", &id, "--title", "Field notes"]);
    assert!(edit.status.success(), "stderr: {}", stderr(&edit));

    let hide = run_with_config(&config, &["projects", "visibility", &id, "hide"]);
    assert!(hide.status.success());

    let list = run_with_config(&config, &["projects", "list"]);
    common::assert_contains_all(&stdout(&list), &["Field notes", "[hidden]", "manual"]);

    let missing = run_with_config(&config, &["projects", "visibility", "999", "show"]);
    assert!(!missing.status.success());
    assert!(stderr(&missing).contains("Project 999 not found"));
}

#[test]
fn test_import_requires_connection() {
    let env = common::TestEnvironment::new();
    let config = env.create_minimal_config();

    let output = run_with_config(&config, &["import", "octo/widget"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not connected"));
}
