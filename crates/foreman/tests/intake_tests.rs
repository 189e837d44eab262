//! Integration tests for `--intake` against a built binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("foreman"))
}

#[test]
fn intake_seeds_tasks_and_moves_document_to_processed() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = temp_dir.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    let doc_path = inbox.join("req.txt");
    std::fs::write(
        &doc_path,
        r#"## Status
draft

## 项目要求
Build the widget end to end.

## 运行参数
max_attempts: 4

## Task Seeds
- id: t-widget
  goal: implement the widget
  acceptance: widget compiles
  constraints: none
  verification: none
  scope: src/widget.rs
  priority: P1
"#,
    )
    .unwrap();

    foreman()
        .current_dir(temp_dir.path())
        .arg("--intake")
        .arg(&doc_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("seeded 1 task"))
        .stdout(predicate::str::contains("t-widget"));

    assert!(!doc_path.exists());
    assert!(inbox.join("processed").join("req.txt").exists());

    let requirements = std::fs::read_to_string(temp_dir.path().join("REQUIREMENTS.md")).unwrap();
    assert!(requirements.contains("Build the widget end to end"));
}

#[test]
fn intake_rejects_document_missing_required_section() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = temp_dir.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    let doc_path = inbox.join("bad.txt");
    std::fs::write(&doc_path, "## Status\ndraft\n").unwrap();

    foreman()
        .current_dir(temp_dir.path())
        .arg("--intake")
        .arg(&doc_path)
        .assert()
        .failure()
        .code(1);

    assert!(doc_path.exists(), "failed document should stay in place");
}
