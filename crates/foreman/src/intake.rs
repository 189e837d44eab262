//! The Intake Processor: parses labeled-section requirement documents from
//! `inbox/`, validates and merges them into the task file, and moves
//! processed documents out of the way.
//!
//! Sections are line-oriented and `##`-delimited, each one optional with
//! its own default, so a document can seed tasks, override config, or
//! just add requirements prose without touching the others. Dependency and
//! cycle validation reuses `graph::DependencyGraph` unchanged.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::{Priority, TaskRecord};
use crate::errors::{intake_validation, ActionableError};
use crate::graph::DependencyGraph;
use crate::storage::TaskStore;

const SECTION_HEADER: &str = r"(?m)^##\s*(.+?)\s*$";

fn section_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SECTION_HEADER).unwrap())
}

#[derive(Debug, Clone, Default)]
pub struct SeededTask {
    pub id: Option<String>,
    pub goal: String,
    pub acceptance: String,
    pub constraints: String,
    pub verification: String,
    pub scope: String,
    pub priority: Priority,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IntakeDocument {
    pub status: String,
    pub requirements_prose: String,
    pub config_overrides: Vec<(String, String)>,
    pub seeds: Vec<SeededTask>,
}

/// Splits `text` into named sections on `## Header` lines.
fn split_sections(text: &str) -> Vec<(String, String)> {
    let headers: Vec<(usize, String)> = section_header_re()
        .captures_iter(text)
        .map(|c| (c.get(0).unwrap().start(), c[1].trim().to_string()))
        .collect();

    let mut sections = Vec::new();
    for (i, (start, name)) in headers.iter().enumerate() {
        let header_line_end = text[*start..].find('\n').map(|n| start + n + 1).unwrap_or(text.len());
        let end = headers.get(i + 1).map(|(s, _)| *s).unwrap_or(text.len());
        let body = text[header_line_end..end].trim().to_string();
        sections.push((name.clone(), body));
    }
    sections
}

/// Parses a document, rejecting it if a required section is missing.
pub fn parse(text: &str) -> Result<IntakeDocument, ActionableError> {
    let sections = split_sections(text);
    let mut doc = IntakeDocument::default();

    let required = ["Status", "项目要求", "运行参数", "Task Seeds"];
    for name in required {
        if !sections.iter().any(|(n, _)| n == name) {
            return Err(intake_validation("<document>", &format!("missing required section: {name}")));
        }
    }

    for (name, body) in sections {
        match name.as_str() {
            "Status" => doc.status = body,
            "项目要求" => doc.requirements_prose = body,
            "运行参数" => {
                for line in body.lines() {
                    if let Some((key, value)) = line.split_once(':') {
                        doc.config_overrides.push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
            }
            "Task Seeds" => doc.seeds = parse_seeds(&body)?,
            _ => {}
        }
    }

    Ok(doc)
}

fn parse_seeds(body: &str) -> Result<Vec<SeededTask>, ActionableError> {
    let mut seeds = Vec::new();
    let mut current: Option<SeededTask> = None;

    for line in body.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("- ") {
            if let Some(seed) = current.take() {
                seeds.push(seed);
            }
            current = Some(SeededTask::default());
            apply_seed_field(current.as_mut().unwrap(), rest)?;
        } else if let Some(seed) = current.as_mut() {
            if !trimmed.is_empty() {
                apply_seed_field(seed, trimmed)?;
            }
        }
    }
    if let Some(seed) = current.take() {
        seeds.push(seed);
    }
    Ok(seeds)
}

fn apply_seed_field(seed: &mut SeededTask, line: &str) -> Result<(), ActionableError> {
    let Some((key, value)) = line.split_once(':') else {
        return Ok(());
    };
    let key = key.trim();
    let value = value.trim().to_string();
    match key {
        "id" => seed.id = Some(value),
        "goal" => seed.goal = value,
        "acceptance" => seed.acceptance = value,
        "constraints" => seed.constraints = value,
        "verification" => seed.verification = value,
        "scope" => seed.scope = value,
        "priority" => {
            seed.priority = match value.as_str() {
                "P0" => Priority::P0,
                "P2" => Priority::P2,
                _ => Priority::P1,
            };
        }
        "depends_on" => {
            seed.depends_on = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        _ => {}
    }
    Ok(())
}

/// Validates a parsed document against itself and, via `existing_ids`,
/// against the current task file: ids are unique within the document,
/// every dependency resolves, priorities are valid (`parse` already
/// normalizes unrecognized values to P1 per spec default).
fn validate(doc: &IntakeDocument, existing_ids: &HashSet<String>) -> Result<(), ActionableError> {
    let mut seen_in_doc = HashSet::new();
    for seed in &doc.seeds {
        if let Some(id) = &seed.id {
            if !seen_in_doc.insert(id.clone()) {
                return Err(intake_validation("<document>", &format!("duplicate seeded task id: {id}")));
            }
        }
    }

    for seed in &doc.seeds {
        for dep in &seed.depends_on {
            let resolves = seen_in_doc.contains(dep) || existing_ids.contains(dep);
            if !resolves {
                return Err(intake_validation(
                    "<document>",
                    &format!("seeded dependency {dep} does not resolve to any known task"),
                ));
            }
        }
    }

    Ok(())
}

/// Document-level gate 1 of 3: validates each seeded task against the
/// shape a well-formed seed must have, beyond what `validate` already
/// checks (uniqueness, dependency resolution). Rejects seeds missing the
/// fields a task record cannot usefully exist without.
fn validate_schema(doc: &IntakeDocument) -> Result<(), ActionableError> {
    for seed in &doc.seeds {
        let id = seed.id.as_deref().unwrap_or("<unassigned>");
        if seed.goal.trim().is_empty() {
            return Err(intake_validation("<document>", &format!("seed {id} is missing a goal")));
        }
        if seed.acceptance.trim().is_empty() {
            return Err(intake_validation("<document>", &format!("seed {id} is missing acceptance criteria")));
        }
        if seed.verification.trim().is_empty() {
            return Err(intake_validation("<document>", &format!("seed {id} is missing a verification step")));
        }
    }
    Ok(())
}

/// Patterns matched against the raw document text by the secret-scanner
/// gate. Deliberately conservative (specific key formats, not generic
/// high-entropy heuristics) to avoid false-positive rejections of
/// ordinary prose.
fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"AKIA[0-9A-Z]{16}",                 // AWS access key id
            r"-----BEGIN[ A-Z]*PRIVATE KEY-----", // PEM private key
            r"ghp_[A-Za-z0-9]{36}",              // GitHub personal access token
            r"sk-[A-Za-z0-9]{20,}",              // OpenAI-style API key
            r"xox[baprs]-[A-Za-z0-9-]{10,}",     // Slack token
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Document-level gate 2 of 3: rejects a document whose raw text contains
/// what looks like a credential, so a pasted secret never reaches
/// `Task.json` or `REQUIREMENTS.md`.
fn scan_for_secrets(text: &str) -> Result<(), ActionableError> {
    for pattern in secret_patterns() {
        if let Some(m) = pattern.find(text) {
            tracing::warn!(pattern = pattern.as_str(), "intake document rejected by secret scanner");
            return Err(intake_validation(
                "<document>",
                &format!("document appears to contain a credential matching `{}`", m.as_str().chars().take(8).collect::<String>() + "…"),
            ));
        }
    }
    Ok(())
}

/// Appends a numeric suffix to `id` until it no longer collides with
/// `existing_ids` or ids already assigned earlier in this document.
fn resolve_collision(id: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(id) {
        return id.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{id}-{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub struct IntakeReport {
    pub task_ids: Vec<String>,
}

/// Runs the full transactional pipeline for one document: parse, validate,
/// resolve id collisions, merge, run document-level gates, commit, and
/// move the document to `inbox/processed/`. On any failure the document is
/// left in place with an inline annotation and the task file is untouched.
pub fn process_document(
    store: &TaskStore,
    processed_dir: &Path,
    document_path: &Path,
    gate_command: Option<&str>,
) -> Result<IntakeReport, ActionableError> {
    let text = fs::read_to_string(document_path)
        .map_err(|e| ActionableError::new(format!("could not read {}: {e}", document_path.display())))?;

    let result = run_pipeline(store, document_path, &text, gate_command);

    match result {
        Ok(report) => {
            fs::create_dir_all(processed_dir).map_err(|e| {
                ActionableError::new(format!("could not create {}: {e}", processed_dir.display()))
            })?;
            let dest = processed_dir.join(document_path.file_name().unwrap());
            fs::rename(document_path, &dest)
                .map_err(|e| ActionableError::new(format!("could not move document to {}: {e}", dest.display())))?;
            Ok(report)
        }
        Err(err) => {
            let annotated = format!("{text}\n\n<!-- INTAKE FAILED: {err} -->\n");
            let _ = fs::write(document_path, annotated);
            Err(err)
        }
    }
}

fn run_pipeline(
    store: &TaskStore,
    document_path: &Path,
    text: &str,
    gate_command: Option<&str>,
) -> Result<IntakeReport, ActionableError> {
    let doc_name = document_path.display().to_string();
    let doc = parse(text).map_err(|e| ActionableError::new(e.to_string().replace("<document>", &doc_name)))?;

    let existing = store.read()?;
    let existing_ids: HashSet<String> = existing.tasks.iter().map(|t| t.id.clone()).collect();

    validate(&doc, &existing_ids)
        .map_err(|e| ActionableError::new(e.to_string().replace("<document>", &doc_name)))?;

    let mut taken = existing_ids.clone();
    let mut assigned_ids = Vec::new();
    let mut new_tasks = Vec::new();
    for seed in &doc.seeds {
        let base_id = seed.id.clone().unwrap_or_else(|| format!("seed-{}", new_tasks.len() + 1));
        let id = resolve_collision(&base_id, &taken);
        taken.insert(id.clone());
        assigned_ids.push(id.clone());

        let description = format!(
            "{}\n\nAcceptance: {}\nConstraints: {}\nVerification: {}\nScope: {}",
            seed.goal, seed.acceptance, seed.constraints, seed.verification, seed.scope
        );
        let mut task = TaskRecord::new(id, description);
        task.priority = seed.priority;
        task.depends_on = seed.depends_on.iter().cloned().collect();
        new_tasks.push(task);
    }

    let mut all_tasks: Vec<TaskRecord> = existing.tasks.clone();
    all_tasks.extend(new_tasks.iter().cloned());
    validate_no_cycles(&all_tasks).map_err(|e| ActionableError::new(e.to_string().replace("<document>", &doc_name)))?;

    // Document-level gates (spec step 5): schema validator, secret scanner,
    // then the operator-configured verify script. All three must pass
    // before anything is committed.
    validate_schema(&doc).map_err(|e| ActionableError::new(e.to_string().replace("<document>", &doc_name)))?;
    scan_for_secrets(text).map_err(|e| ActionableError::new(e.to_string().replace("<document>", &doc_name)))?;
    if let Some(command) = gate_command {
        let outcome = crate::verify::run_gate(
            document_path.parent().unwrap_or_else(|| Path::new(".")),
            &document_path.parent().unwrap_or_else(|| Path::new(".")).join("runs"),
            &crate::clock::new_run_id(),
            command,
        )?;
        if !outcome.passed {
            tracing::warn!(document = %doc_name, "intake document rejected by verify-script gate");
            return Err(intake_validation(&doc_name, "document-level gate command failed"));
        }
    }

    let report = IntakeReport {
        task_ids: assigned_ids,
    };

    // Single atomic commit (spec step 6): the REQUIREMENTS.md append rides
    // inside the same `mutate` closure as the task/config merge so a crash
    // can never leave one committed without the other — a retry of this
    // document can, at worst, duplicate a harmless prose block, never a
    // task (Task.json's own commit is still the sole source of truth for
    // which ids exist).
    store.mutate(|mut file| {
        if !doc.requirements_prose.trim().is_empty() {
            append_requirements_prose(store, &doc_name, &doc.requirements_prose)?;
        }
        file.tasks.extend(new_tasks.clone());
        for (key, value) in &doc.config_overrides {
            apply_config_override(&mut file.config, key, value);
        }
        Ok((file, ()))
    })?;

    tracing::info!(document = %doc_name, task_count = report.task_ids.len(), "intake document committed");
    Ok(report)
}

/// Appends the document's project-requirements prose to `REQUIREMENTS.md`
/// alongside `Task.json`, tagged with the source document's name so the
/// accumulated file reads as a running log rather than an overwrite.
fn append_requirements_prose(store: &TaskStore, doc_name: &str, prose: &str) -> Result<(), ActionableError> {
    use std::fs::OpenOptions;
    use std::io::Write as _;

    let root = store.path().parent().unwrap_or_else(|| Path::new("."));
    let path = root.join("REQUIREMENTS.md");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| ActionableError::new(format!("could not open {}: {e}", path.display())))?;
    writeln!(file, "## {doc_name}\n\n{prose}\n")
        .map_err(|e| ActionableError::new(format!("could not write {}: {e}", path.display())))?;
    Ok(())
}

fn apply_config_override(config: &mut crate::domain::Config, key: &str, value: &str) {
    match key {
        "lease_ttl_seconds" => {
            if let Ok(v) = value.parse() {
                config.lease_ttl_seconds = v;
            }
        }
        "max_attempts" => {
            if let Ok(v) = value.parse() {
                config.max_attempts = v;
            }
        }
        "verify_required" => {
            if let Ok(v) = value.parse() {
                config.verify_required = v;
            }
        }
        "retention_days" => {
            if let Ok(v) = value.parse() {
                config.retention_days = v;
            }
        }
        "max_runs_mb" => {
            if let Ok(v) = value.parse() {
                config.max_runs_mb = v;
            }
        }
        "max_failures" => {
            if let Ok(v) = value.parse() {
                config.max_failures = v;
            }
        }
        _ => {}
    }
}

/// Validates that a set of seeded dependency edges is acyclic before
/// committing, reusing the shared dependency graph primitive.
pub fn validate_no_cycles(tasks: &[TaskRecord]) -> Result<(), ActionableError> {
    let refs: Vec<&TaskRecord> = tasks.iter().collect();
    let graph = DependencyGraph::new(&refs);
    graph.validate_dag().map_err(|e| ActionableError::new(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> String {
        r#"## Status
draft

## 项目要求
Build a thing that works.

## 运行参数
max_attempts: 5

## Task Seeds
- id: t-foo
  goal: implement the widget
  acceptance: widget compiles
  constraints: none
  verification: cargo test
  scope: src/widget.rs
  priority: P0
- id: t-bar
  goal: wire up the widget
  acceptance: integration test passes
  constraints: depends on widget
  verification: cargo test
  scope: src/main.rs
  priority: P1
  depends_on: t-foo
"#
        .to_string()
    }

    #[test]
    fn parse_extracts_all_sections() {
        let doc = parse(&sample_document()).unwrap();
        assert_eq!(doc.status, "draft");
        assert!(doc.requirements_prose.contains("Build a thing"));
        assert_eq!(doc.config_overrides, vec![("max_attempts".to_string(), "5".to_string())]);
        assert_eq!(doc.seeds.len(), 2);
        assert_eq!(doc.seeds[1].depends_on, vec!["t-foo".to_string()]);
    }

    #[test]
    fn parse_rejects_missing_section() {
        let text = "## Status\ndraft\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn validate_rejects_unresolved_dependency() {
        let mut doc = IntakeDocument::default();
        doc.seeds.push(SeededTask {
            id: Some("t1".to_string()),
            depends_on: vec!["ghost".to_string()],
            ..Default::default()
        });
        let existing = HashSet::new();
        assert!(validate(&doc, &existing).is_err());
    }

    #[test]
    fn resolve_collision_appends_numeric_suffix() {
        let mut taken = HashSet::new();
        taken.insert("t1".to_string());
        assert_eq!(resolve_collision("t1", &taken), "t1-2");
        assert_eq!(resolve_collision("t2", &taken), "t2");
    }

    #[test]
    fn process_document_end_to_end_seeds_two_dependent_tasks() {
        let project_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(project_dir.path());
        store.open().unwrap();

        let inbox = project_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let doc_path = inbox.join("req.txt");
        fs::write(&doc_path, sample_document()).unwrap();

        let processed_dir = inbox.join("processed");
        let report = process_document(&store, &processed_dir, &doc_path, None).unwrap();
        assert_eq!(report.task_ids, vec!["t-foo".to_string(), "t-bar".to_string()]);

        assert!(!doc_path.exists());
        assert!(processed_dir.join("req.txt").exists());

        let file = store.read().unwrap();
        assert_eq!(file.tasks.len(), 2);
        assert_eq!(file.config.max_attempts, 5);
        let bar = file.find("t-bar").unwrap();
        assert!(bar.depends_on.contains("t-foo"));
    }

    #[test]
    fn process_document_appends_requirements_prose() {
        let project_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(project_dir.path());
        store.open().unwrap();

        let inbox = project_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let doc_path = inbox.join("req.txt");
        fs::write(&doc_path, sample_document()).unwrap();

        let processed_dir = inbox.join("processed");
        process_document(&store, &processed_dir, &doc_path, None).unwrap();

        let requirements = fs::read_to_string(project_dir.path().join("REQUIREMENTS.md")).unwrap();
        assert!(requirements.contains("Build a thing that works"));
    }

    #[test]
    fn process_document_rejects_seeded_dependency_cycle() {
        let project_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(project_dir.path());
        store.open().unwrap();

        let inbox = project_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let doc_path = inbox.join("cyclic.txt");
        let cyclic_doc = r#"## Status
draft

## 项目要求
Two tasks that depend on each other.

## 运行参数

## Task Seeds
- id: a
  goal: do a
  depends_on: b
- id: b
  goal: do b
  depends_on: a
"#;
        fs::write(&doc_path, cyclic_doc).unwrap();

        let processed_dir = inbox.join("processed");
        let result = process_document(&store, &processed_dir, &doc_path, None);
        assert!(result.is_err());
        assert!(doc_path.exists());
        let file = store.read().unwrap();
        assert!(file.tasks.is_empty());
    }

    #[test]
    fn process_document_leaves_file_untouched_on_validation_failure() {
        let project_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(project_dir.path());
        store.open().unwrap();

        let inbox = project_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let doc_path = inbox.join("bad.txt");
        let bad_doc = r#"## Status
draft

## 项目要求
Broken doc.

## 运行参数

## Task Seeds
- id: t1
  goal: x
  depends_on: ghost
"#;
        fs::write(&doc_path, bad_doc).unwrap();

        let processed_dir = inbox.join("processed");
        let result = process_document(&store, &processed_dir, &doc_path, None);
        assert!(result.is_err());
        assert!(doc_path.exists());
        let file = store.read().unwrap();
        assert!(file.tasks.is_empty());
        let annotated = fs::read_to_string(&doc_path).unwrap();
        assert!(annotated.contains("INTAKE FAILED"));
    }

    #[test]
    fn validate_schema_rejects_seed_missing_acceptance() {
        let mut doc = IntakeDocument::default();
        doc.seeds.push(SeededTask {
            id: Some("t1".to_string()),
            goal: "do the thing".to_string(),
            verification: "cargo test".to_string(),
            ..Default::default()
        });
        assert!(validate_schema(&doc).is_err());
    }

    #[test]
    fn scan_for_secrets_rejects_embedded_aws_key() {
        let text = "## Status\ndraft\n\nAKIAABCDEFGHIJKLMNOP\n";
        assert!(scan_for_secrets(text).is_err());
    }

    #[test]
    fn scan_for_secrets_allows_ordinary_prose() {
        let text = "## Status\ndraft\n\nNothing sensitive here.\n";
        assert!(scan_for_secrets(text).is_ok());
    }

    #[test]
    fn process_document_rejects_document_containing_a_secret() {
        let project_dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(project_dir.path());
        store.open().unwrap();

        let inbox = project_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let doc_path = inbox.join("leaky.txt");
        let leaky_doc = format!(
            "{}\n\nAKIAABCDEFGHIJKLMNOP\n",
            sample_document()
        );
        fs::write(&doc_path, leaky_doc).unwrap();

        let processed_dir = inbox.join("processed");
        let result = process_document(&store, &processed_dir, &doc_path, None);
        assert!(result.is_err());
        assert!(doc_path.exists());
        let file = store.read().unwrap();
        assert!(file.tasks.is_empty());
    }
}
