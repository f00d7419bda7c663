use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cred_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cred");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/credence.sqlite"

[chunking]
max_tokens = 256
tokenizer = "bytes"

[retrieval]
limit = 5
threshold = 0.68
"#,
        root.display()
    );

    let config_path = config_dir.join("credence.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cred(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cred_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cred binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cred(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/credence.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cred(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cred(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (stdout, stderr, success) = run_cred(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:   0"));
    assert!(stdout.contains("Checkpoint:  none"));
}

#[test]
fn test_stats_json() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (stdout, _, success) = run_cred(&config_path, &["--json", "stats"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["documents"], 0);
    assert_eq!(value["checkpoint"], serde_json::Value::Null);
}

#[test]
fn test_trust_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (_, stderr, success) = run_cred(&config_path, &["trust", "missing-id", "--decrease"]);
    assert!(!success);
    assert!(stderr.contains("Not found"), "stderr: {}", stderr);
}

#[test]
fn test_trust_requires_direction() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_cred(&config_path, &["trust", "some-id"]);
    assert!(!success);
    let (_, _, success) = run_cred(&config_path, &["trust", "some-id", "--increase", "--decrease"]);
    assert!(!success);
}

#[test]
fn test_search_blank_query_returns_nothing() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (stdout, _, success) = run_cred(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_without_provider_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (_, stderr, success) = run_cred(&config_path, &["search", "interest rates"]);
    assert!(!success);
    assert!(stderr.contains("embeddings"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_without_feed_url_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cred(&config_path, &["init"]);
    let (_, stderr, success) = run_cred(&config_path, &["ingest"]);
    assert!(!success);
    assert!(stderr.contains("base_url"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, success) = run_cred(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
}
