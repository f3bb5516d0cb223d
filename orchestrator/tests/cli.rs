//! CLI tests: spawn the orchestrator binary and check exit codes and output.

use std::process::{Command, Output};

use serde_json::Value;

use orchestrator::core::types::ThreadId;
use orchestrator::exit_codes;
use orchestrator::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use orchestrator::io::config::{OrchestratorConfig, write_config};
use orchestrator::io::paths::{InitOptions, OrchestratorPaths, init_workspace};

fn orchestrator(root: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn orchestrator")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

/// Workspace whose planner always finalizes with `answer`.
#[cfg(unix)]
fn workspace_with_planner(answer: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
    let mut config = OrchestratorConfig::default();
    config.planner.command = vec![
        "sh".into(),
        "-c".into(),
        format!("cat >/dev/null; echo '{{\"type\":\"finalize\",\"answer\":\"{answer}\"}}'"),
    ];
    write_config(&paths.config_path, &config).expect("write config");
    temp
}

#[test]
fn init_creates_the_workspace_and_refuses_to_clobber_it() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = orchestrator(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let paths = OrchestratorPaths::new(temp.path());
    assert!(paths.config_path.is_file());
    assert!(paths.checkpoints_dir.is_dir());

    let second = orchestrator(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = orchestrator(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn run_without_a_workspace_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = orchestrator(temp.path(), &["run", "r1:chat", "hello"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(String::from_utf8_lossy(&output.stderr).contains("orchestrator init"));
}

#[cfg(unix)]
#[test]
fn run_prints_the_completed_payload() {
    let temp = workspace_with_planner("X");

    let output = orchestrator(temp.path(), &["run", "r1:chat", "hello"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let payload = stdout_json(&output);
    assert_eq!(payload["status"], "COMPLETED");
    assert_eq!(payload["answer"], "X");

    let listed = orchestrator(temp.path(), &["checkpoints", "r1:chat"]);
    assert_eq!(listed.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&listed).as_array().map(Vec::len), Some(1));

    let threads = orchestrator(temp.path(), &["checkpoints"]);
    assert_eq!(stdout_json(&threads), serde_json::json!(["r1:chat"]));
}

/// A lock recorded through `world apply` suspends the run; releasing it
/// lets the next run complete.
#[cfg(unix)]
#[test]
fn world_apply_drives_the_gate() {
    let temp = workspace_with_planner("ok");
    let lock = r#"{"change":"open_lock","lock_id":"L1","issue_key":"ISSUE-1","reason":"decided"}"#;
    let applied = orchestrator(temp.path(), &["world", "apply", "r1", lock]);
    assert_eq!(applied.status.code(), Some(exit_codes::OK));

    let blocked = orchestrator(
        temp.path(),
        &["run", "r1:chat", "reclassify", "--issue", "ISSUE-1"],
    );
    assert_eq!(blocked.status.code(), Some(exit_codes::NEEDS_REVIEW));
    let payload = stdout_json(&blocked);
    assert_eq!(payload["status"], "NEEDS_REVIEW");
    assert_eq!(payload["next_actions"][0]["action"], "SUPERSEDE_LOCK");

    let release = r#"{"change":"release_lock","lock_id":"L1"}"#;
    orchestrator(temp.path(), &["world", "apply", "r1", release]);
    let shown = stdout_json(&orchestrator(temp.path(), &["world", "show", "r1"]));
    assert_eq!(shown["locks"][0]["active"], false);

    let done = orchestrator(
        temp.path(),
        &["run", "r1:chat", "reclassify", "--issue", "ISSUE-1"],
    );
    assert_eq!(done.status.code(), Some(exit_codes::OK));
}

#[test]
fn invalid_world_change_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

    let output = orchestrator(
        temp.path(),
        &["world", "apply", "r1", r#"{"change":"release_lock","lock_id":"missing"}"#],
    );
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
}

#[cfg(unix)]
#[test]
fn reset_and_prune_report_deleted_counts() {
    let temp = workspace_with_planner("X");
    for _ in 0..3 {
        let output = orchestrator(temp.path(), &["run", "r1:chat", "hello"]);
        assert_eq!(output.status.code(), Some(exit_codes::OK));
    }

    let pruned = orchestrator(temp.path(), &["prune", "r1:chat", "--keep", "1"]);
    assert_eq!(String::from_utf8_lossy(&pruned.stdout).trim(), "2");

    let reset = orchestrator(temp.path(), &["reset", "--run", "r1"]);
    assert_eq!(String::from_utf8_lossy(&reset.stdout).trim(), "1");
    let threads = orchestrator(temp.path(), &["checkpoints"]);
    assert_eq!(stdout_json(&threads), serde_json::json!([]));
}

/// A thread claimed by another process cannot be run, reset or pruned.
#[cfg(unix)]
#[test]
fn claimed_thread_is_rejected_across_processes() {
    let temp = workspace_with_planner("X");
    let paths = OrchestratorPaths::new(temp.path());
    let store = FileCheckpointStore::new(&paths.checkpoints_dir);
    let claim = store
        .claim(&ThreadId::parse("r1:chat").expect("thread"))
        .expect("claim");

    for args in [
        vec!["run", "r1:chat", "hello"],
        vec!["reset", "r1:chat"],
        vec!["prune", "r1:chat", "--keep", "1"],
    ] {
        let output = orchestrator(temp.path(), &args);
        assert_eq!(output.status.code(), Some(exit_codes::ERROR), "{args:?}");
        assert!(
            String::from_utf8_lossy(&output.stderr).contains("in flight"),
            "{args:?}"
        );
    }

    drop(claim);
    let reset = orchestrator(temp.path(), &["reset", "r1:chat"]);
    assert_eq!(reset.status.code(), Some(exit_codes::OK));
}
