//! Tests of the `kb` binary that need no external services.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kb"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let docs = root.join("knowledge_base");
    fs::create_dir_all(docs.join("guides")).unwrap();
    fs::write(docs.join("notes.txt"), "Paris is the capital of France.").unwrap();
    fs::write(docs.join("guides").join("setup.md"), "# Setup\n\nRun the installer.").unwrap();
    fs::write(docs.join("image.png"), b"\x89PNG").unwrap();

    let config_path = root.join("kb.toml");
    fs::write(
        &config_path,
        r#"
[paths]
knowledge_dir = "knowledge_base"
index_dir = "data/index"
manifest_path = "data/file_tracking.json"

[chunking]
chunk_size = 500
chunk_overlap = 50

[retrieval]
top_k = 4

[server]
bind = "127.0.0.1:0"
"#,
    )
    .unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(kb_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run kb binary");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_files_lists_supported_files() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_kb(&config, &["files"]);
    assert!(success, "files failed: {}", stderr);
    assert!(stdout.contains("notes.txt"));
    assert!(stdout.contains("TXT"));
    assert!(stdout.contains("guides/setup.md"));
    assert!(!stdout.contains("image.png"));
}

#[test]
fn test_sync_without_embedder_reports_failures_and_retries() {
    let (tmp, config) = setup_test_env();

    // Embedding is disabled, so every file fails and stays pending.
    let (stdout, stderr, success) = run_kb(&config, &["sync"]);
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("files changed:   2"));
    assert!(stdout.contains("files ingested:  0"));
    assert!(stdout.contains("notes.txt"));
    assert!(tmp.path().join("data/file_tracking.json").exists());

    let (stdout, _, success) = run_kb(&config, &["sync"]);
    assert!(success);
    assert!(stdout.contains("files changed:   2"));
}

#[test]
fn test_ask_without_index_fails() {
    let (tmp, config) = setup_test_env();
    fs::remove_dir_all(tmp.path().join("knowledge_base")).unwrap();
    fs::create_dir_all(tmp.path().join("knowledge_base")).unwrap();

    let (_, stderr, success) = run_kb(&config, &["ask", "What is the capital?"]);
    assert!(!success);
    assert!(stderr.contains("empty"), "unexpected error: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("bad.toml");
    fs::write(&bad, "[chunking]\nchunk_size = 100\nchunk_overlap = 200\n").unwrap();

    let (_, stderr, success) = run_kb(&bad, &["files"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"));
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    let (tmp, _) = setup_test_env();
    let (_, stderr, success) = run_kb(&tmp.path().join("nope.toml"), &["files"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
