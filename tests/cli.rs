use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn csync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("csync");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let notes = root.join("objects").join("notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(
        notes.join("cells.md"),
        "# Cell Biology\n\nThe **mitochondria** is the powerhouse of the cell.\n\nRibosomes build proteins.",
    )
    .unwrap();
    fs::write(
        notes.join("lecture.vtt"),
        "WEBVTT\n\n00:00:01.000 --> 00:00:04.000\nWelcome to photosynthesis\n\n00:00:04.000 --> 00:00:08.000\nChlorophyll absorbs light\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/csync.sqlite"

[queue]
max_attempts = 3
backoff_base_ms = 1
backoff_max_ms = 5

[extraction]
object_root = "{root}/objects"

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("csync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_csync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = csync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run csync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn create_cells(config_path: &Path) {
    let (stdout, stderr, success) = run_csync(
        config_path,
        &[
            "content",
            "create",
            "--id",
            "cells",
            "--kind",
            "document",
            "--source",
            "object://notes/cells.md",
            "--title",
            "Cell Biology",
        ],
    );
    assert!(success, "create failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Created cells v1"), "got: {}", stdout);
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_csync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/csync.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_csync(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_csync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_create_work_search() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);

    // Nothing is searchable before the pipeline runs.
    let (stdout, _, _) = run_csync(&config_path, &["search", "mitochondria"]);
    assert!(stdout.contains("No results."), "got: {}", stdout);

    let (stdout, stderr, success) = run_csync(&config_path, &["work", "--drain"]);
    assert!(success, "work failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Relayed 1"), "got: {}", stdout);

    let (stdout, _, success) = run_csync(&config_path, &["search", "mitochondria"]);
    assert!(success);
    assert!(stdout.contains("Cell Biology"), "got: {}", stdout);
    assert!(stdout.contains("id: cells"), "got: {}", stdout);

    let (stdout, _, _) = run_csync(&config_path, &["status", "cells"]);
    assert!(stdout.contains("ledger head: v1"), "got: {}", stdout);
    assert!(stdout.contains("index:       v1"), "got: {}", stdout);
    assert!(stdout.contains("extraction:  success"), "got: {}", stdout);
    assert!(stdout.contains("converged:   yes"), "got: {}", stdout);
}

#[test]
fn test_update_and_delete_flow() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);

    let (stdout, _, success) = run_csync(
        &config_path,
        &["content", "update", "cells", "--title", "Cells and Organelles"],
    );
    assert!(success);
    assert!(stdout.contains("Updated cells v2"), "got: {}", stdout);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, _) = run_csync(&config_path, &["search", "organelles"]);
    assert!(stdout.contains("Cells and Organelles"), "got: {}", stdout);
    assert!(stdout.contains("version: 2"), "got: {}", stdout);

    let (stdout, _, success) = run_csync(&config_path, &["content", "delete", "cells"]);
    assert!(success);
    assert!(stdout.contains("Deleted cells v3"), "got: {}", stdout);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, _) = run_csync(&config_path, &["search", "mitochondria"]);
    assert!(stdout.contains("No results."), "got: {}", stdout);
    let (stdout, _, _) = run_csync(&config_path, &["status", "cells"]);
    assert!(stdout.contains("retracted at v3"), "got: {}", stdout);

    let (stdout, _, _) = run_csync(&config_path, &["history", "cells"]);
    assert!(stdout.contains("create"));
    assert!(stdout.contains("update"));
    assert!(stdout.contains("delete"));
}

#[test]
fn test_restore_reindexes() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);
    run_csync(&config_path, &["content", "delete", "cells"]);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, success) = run_csync(&config_path, &["content", "restore", "cells"]);
    assert!(success);
    assert!(stdout.contains("Restored cells v3"), "got: {}", stdout);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, _) = run_csync(&config_path, &["search", "mitochondria"]);
    assert!(stdout.contains("id: cells"), "got: {}", stdout);
}

#[test]
fn test_video_captions_feed_suggestions() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    let (_, stderr, success) = run_csync(
        &config_path,
        &[
            "content",
            "create",
            "--kind",
            "video",
            "--source",
            "object://notes/lecture.vtt",
            "--title",
            "Plant Energy",
        ],
    );
    assert!(success, "create failed: {}", stderr);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, _) = run_csync(&config_path, &["search", "chlorophyll"]);
    assert!(stdout.contains("Plant Energy"), "got: {}", stdout);

    let (stdout, _, success) = run_csync(&config_path, &["suggest", "welc"]);
    assert!(success);
    assert!(stdout.contains("Welcome to photosynthesis"), "got: {}", stdout);
}

#[test]
fn test_missing_source_indexes_metadata_only() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    run_csync(
        &config_path,
        &[
            "content",
            "create",
            "--id",
            "ghost",
            "--kind",
            "document",
            "--source",
            "object://notes/missing.pdf",
            "--title",
            "Haunted Syllabus",
        ],
    );
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, _) = run_csync(&config_path, &["search", "syllabus"]);
    assert!(stdout.contains("id: ghost"), "got: {}", stdout);
    let (stdout, _, _) = run_csync(&config_path, &["status", "ghost"]);
    assert!(stdout.contains("extraction:  failed"), "got: {}", stdout);

    let (stdout, _, _) = run_csync(&config_path, &["dead-letters", "list"]);
    assert!(stdout.contains("No dead-lettered"), "got: {}", stdout);
}

#[test]
fn test_reconcile_in_sync() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, stderr, success) = run_csync(&config_path, &["reconcile"]);
    assert!(success, "reconcile failed: {}", stderr);
    assert!(stdout.contains("Scanned 1"), "got: {}", stdout);
    assert!(stdout.contains("re-indexed:   0"), "got: {}", stdout);
}

#[test]
fn test_reconcile_redrives_unrelayed_content() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);

    // Outbox not yet relayed: the reconciler sees the gap and enqueues extraction.
    let (stdout, _, _) = run_csync(&config_path, &["reconcile"]);
    assert!(stdout.contains("re-indexed:   1"), "got: {}", stdout);

    run_csync(&config_path, &["work", "--drain"]);
    let (stdout, _, _) = run_csync(&config_path, &["status", "cells"]);
    assert!(stdout.contains("converged:   yes"), "got: {}", stdout);
}

#[test]
fn test_invalid_kind_and_unknown_id() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);

    let (_, stderr, success) = run_csync(
        &config_path,
        &[
            "content", "create", "--kind", "podcast", "--source", "inline:x", "--title", "x",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("unknown content kind"), "got: {}", stderr);

    let (_, stderr, success) = run_csync(&config_path, &["content", "delete", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_stats_runs() {
    let (_tmp, config_path) = setup_test_env();
    run_csync(&config_path, &["init"]);
    create_cells(&config_path);
    run_csync(&config_path, &["work", "--drain"]);

    let (stdout, _, success) = run_csync(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Content Sync: Pipeline Stats"), "got: {}", stdout);
    assert!(stdout.is_ascii(), "non-ASCII stats output: {}", stdout);
    assert!(stdout.contains("Content:     1"), "got: {}", stdout);
    assert!(stdout.contains("Outbox:      0 pending"), "got: {}", stdout);
    assert!(stdout.contains("Indexed:     1 / 1"), "got: {}", stdout);
}

#[test]
fn test_completions_without_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, success) = run_csync(&tmp.path().join("absent.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("csync"));
}
