//! Integration tests driving a full claim -> worker -> verify -> complete
//! turn through the built binary, with a trivial shell "worker".

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("foreman"))
}

fn seed_one_task(root: &std::path::Path) {
    let inbox = root.join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    let doc_path = inbox.join("req.txt");
    std::fs::write(
        &doc_path,
        r#"## Status
draft

## 项目要求
A trivial task for the turn to claim.

## 运行参数

## Task Seeds
- id: t-trivial
  goal: succeed immediately
  acceptance: the worker reports completed
  constraints: none
  verification: none
  scope: n/a
  priority: P0
"#,
    )
    .unwrap();

    foreman()
        .current_dir(root)
        .arg("--intake")
        .arg(&doc_path)
        .assert()
        .success();
}

fn write_foreman_toml(root: &std::path::Path) {
    let worker_command = r#"printf '{"task_id":"%s","run_id":"%s","status":"completed","verify":{"command":"true","exit_code":0,"evidence":"ok"}}' "$TASK_ID" "$RUN_ID""#;
    std::fs::write(
        root.join("foreman.toml"),
        format!("worker_command = '{worker_command}'\n"),
    )
    .unwrap();
}

#[test]
fn one_turn_claims_runs_and_completes_the_only_eligible_task() {
    let temp_dir = TempDir::new().unwrap();
    seed_one_task(temp_dir.path());
    write_foreman_toml(temp_dir.path());

    foreman()
        .current_dir(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("t-trivial: completed"));

    let task_json = std::fs::read_to_string(temp_dir.path().join("Task.json")).unwrap();
    assert!(task_json.contains("\"completed\""));

    let runs_dir = temp_dir.path().join("runs");
    let entries: Vec<_> = std::fs::read_dir(&runs_dir).unwrap().collect();
    assert!(!entries.is_empty(), "worker run should be archived under runs/");
}

#[test]
fn second_turn_after_completion_reports_nothing_eligible() {
    let temp_dir = TempDir::new().unwrap();
    seed_one_task(temp_dir.path());
    write_foreman_toml(temp_dir.path());

    foreman().current_dir(temp_dir.path()).assert().success();

    foreman()
        .current_dir(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing eligible to claim"));
}
