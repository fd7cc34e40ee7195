//! CLI tests: spawn the binary and check exit codes and printed records.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use orchestrator::core::types::StoryStatus;
use orchestrator::exit_codes;
use orchestrator::io::backlog_store::load_backlog;
use orchestrator::io::init::ProjectPaths;

fn orchestrator(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn orchestrator")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_and_add_story_write_the_backlog() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = orchestrator(temp.path(), &["init", "demo"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let add = orchestrator(
        temp.path(),
        &[
            "add-story",
            "demo",
            "--id",
            "S-1",
            "--description",
            "Users can register",
            "--criterion",
            "returns 201",
        ],
    );
    assert_eq!(add.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&add).trim(), "S-1");

    let paths = ProjectPaths::new(temp.path(), "demo");
    let backlog = load_backlog(&paths.backlog_path).expect("backlog");
    let story = backlog.story("S-1").expect("story");
    assert_eq!(story.status, StoryStatus::Pending);
    assert_eq!(story.acceptance_criteria, vec!["returns 201"]);

    let duplicate = orchestrator(
        temp.path(),
        &["add-story", "demo", "--id", "S-1", "--description", "again"],
    );
    assert_eq!(duplicate.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn missing_project_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = orchestrator(temp.path(), &["snapshots", "nope"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn snapshot_then_unknown_rollback() {
    let temp = tempfile::tempdir().expect("tempdir");
    orchestrator(temp.path(), &["init", "demo"]);

    let capture = orchestrator(temp.path(), &["snapshot", "demo", "--sprint", "1"]);
    assert_eq!(capture.status.code(), Some(exit_codes::OK));
    let backup_id = stdout(&capture).trim().to_string();
    assert!(backup_id.starts_with("bk-"));

    let listed = orchestrator(temp.path(), &["snapshots", "demo"]);
    assert!(stdout(&listed).contains(&backup_id));

    let missing = orchestrator(temp.path(), &["rollback", "demo", "bk-20240101_000000-zzzzzz"]);
    assert_eq!(missing.status.code(), Some(exit_codes::NOT_FOUND));

    let restored = orchestrator(temp.path(), &["rollback", "demo", &backup_id]);
    assert_eq!(restored.status.code(), Some(exit_codes::OK));
}

#[test]
fn rollback_refuses_while_another_process_runs_a_sprint() {
    let temp = tempfile::tempdir().expect("tempdir");
    orchestrator(temp.path(), &["init", "demo"]);
    let capture = orchestrator(temp.path(), &["snapshot", "demo", "--sprint", "1"]);
    let backup_id = stdout(&capture).trim().to_string();

    // This test process stands in for a live sprint owner.
    let paths = ProjectPaths::new(temp.path(), "demo");
    fs::write(paths.sprint_lock_path(), format!("{}\n", std::process::id())).expect("lock");

    let refused = orchestrator(temp.path(), &["rollback", "demo", &backup_id]);
    assert_eq!(refused.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&refused.stderr).contains("while a sprint is running"));

    fs::remove_file(paths.sprint_lock_path()).expect("unlock");
    let restored = orchestrator(temp.path(), &["rollback", "demo", &backup_id]);
    assert_eq!(restored.status.code(), Some(exit_codes::OK));
}

#[test]
fn extract_recovers_fenced_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("reply.txt");
    fs::write(
        &file,
        "Here you go:\n```json\n{\"story_id\": \"S-1\", \"tasks\": [],}\n```\n",
    )
    .expect("write");

    let output = orchestrator(temp.path(), &["extract", file.to_str().expect("utf-8 path")]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(record["story_id"], "S-1");
}

#[test]
fn extract_without_record_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("reply.txt");
    fs::write(&file, "I could not produce a plan.").expect("write");

    let output = orchestrator(temp.path(), &["extract", file.to_str().expect("utf-8 path")]);

    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn check_breakdown_reports_acceptance() {
    let temp = tempfile::tempdir().expect("tempdir");
    let good = temp.path().join("good.json");
    fs::write(
        &good,
        r#"{"story_id": "S-1", "tasks": [{"task_id": "S-1-T01", "description": "add route", "files_to_create": ["src/app.js"]}]}"#,
    )
    .expect("write");
    let empty = temp.path().join("empty.json");
    fs::write(&empty, r#"{"story_id": "S-1", "tasks": []}"#).expect("write");

    let accepted = orchestrator(
        temp.path(),
        &["check-breakdown", good.to_str().expect("utf-8 path"), "--story", "S-1"],
    );
    assert_eq!(accepted.status.code(), Some(exit_codes::OK));
    assert!(stdout(&accepted).contains("S-1-T01"));

    let rejected = orchestrator(
        temp.path(),
        &["check-breakdown", empty.to_str().expect("utf-8 path"), "--story", "S-1"],
    );
    assert_eq!(rejected.status.code(), Some(exit_codes::STORIES_FAILED));
}
