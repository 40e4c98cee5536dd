//! End-to-end tests of the mpush binary that need no board attached.

mod common;

use std::path::Path;
use std::process::{Command, Output};

use common::{assert_contains, assert_path_exists, init_test_logging};

const ENV_OVERRIDES: &[&str] = &[
    "MPUSH_PORT",
    "MPUSH_BAUD",
    "MPUSH_CHUNK_SOURCE",
    "MPUSH_RETRIES",
    "MPUSH_COMMAND_TIMEOUT_MS",
    "MPUSH_RAW_PASTE",
    "MPUSH_LOG_FILE",
];

fn mpush(dir: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mpush"));
    cmd.current_dir(dir).args(args);
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    let output = cmd.output().expect("failed to run mpush");
    crate::test_log!(
        "mpush {:?} exited with {:?}",
        args,
        output.status.code()
    );
    output
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_commands() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let output = mpush(dir.path(), &["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["init", "deploy", "exec", "wipe", "reset"] {
        assert_contains(&text, command);
    }
}

#[test]
fn test_init_writes_config_once() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let first = mpush(dir.path(), &["init"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let config = dir.path().join("deploy.toml");
    assert_path_exists(&config);
    assert_contains(&std::fs::read_to_string(&config).unwrap(), "target_root");

    let second = mpush(dir.path(), &["init"]);
    assert_eq!(second.status.code(), Some(1));
    assert_contains(&stderr(&second), "MPU-");
}

#[test]
fn test_deploy_without_config_writes_default() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let output = mpush(dir.path(), &["deploy"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_path_exists(&dir.path().join("deploy.toml"));
    assert_contains(&stderr(&output), "wrote defaults");
}

#[test]
fn test_dry_run_prints_plan() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    assert!(mpush(dir.path(), &["init"]).status.success());
    std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
    std::fs::create_dir(dir.path().join("lib")).unwrap();
    std::fs::write(dir.path().join("lib").join("a.py"), "x = 1\n").unwrap();

    let output = mpush(dir.path(), &["deploy", "--dry-run"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(plan["file_count"], 2);
    assert_eq!(plan["total_bytes"], 18);
    assert_eq!(plan["steps"][0]["op"], "mkdir");
    assert_eq!(plan["steps"][0]["path"], "/lib");
    let ops: Vec<&str> = plan["steps"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|step| step["op"].as_str())
        .collect();
    assert_eq!(ops.iter().filter(|op| **op == "verify").count(), 2);
}

#[test]
fn test_dry_run_with_no_matches_fails() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    assert!(mpush(dir.path(), &["init"]).status.success());

    let output = mpush(dir.path(), &["deploy", "--dry-run"]);
    assert_eq!(output.status.code(), Some(1));
    assert_contains(&stderr(&output), "error:");
}

#[test]
fn test_exec_requires_code_or_file() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let output = mpush(dir.path(), &["exec"]);
    assert_eq!(output.status.code(), Some(2));
    assert_contains(&stderr(&output), "<CODE>");
}
