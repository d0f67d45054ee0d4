use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn canopy_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("canopy");
    path
}

const DOCUMENT: &str = "\
Rust programs are compiled ahead of time. The compiler checks ownership rules.

Cargo manages dependencies for Rust projects. It also runs the test suite.

Tokio is an asynchronous runtime. It schedules tasks across worker threads.

SQLite stores data in a single file. Write-ahead logging allows concurrent readers.

Summaries are grouped by similarity. Each level is more abstract than the last.

The root of the tree holds the essential point. It is at most three sentences long.
";

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    let doc_path = files_dir.join("notes.md");
    fs::write(&doc_path, DOCUMENT).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/canopy.sqlite"

[segmentation]
max_tokens = 25

[build]
max_group_size_hint = 2
retry_count = 0
retry_backoff_ms = 0

[grouping]
method = "sequential"

[embedding]
provider = "hash"
dims = 32

[synthesis]
provider = "extractive"
"#,
        root.display()
    );

    let config_path = config_dir.join("canopy.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, doc_path)
}

fn run_canopy(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = canopy_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run canopy binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Build the test document and return the root id.
fn build(config_path: &Path, doc_path: &Path) -> String {
    let (stdout, stderr, success) = run_canopy(
        config_path,
        &["build", doc_path.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Built tree "))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| panic!("no root in build output: {}", stdout))
}

fn get_json(config_path: &Path, id: &str) -> serde_json::Value {
    let (stdout, stderr, success) = run_canopy(config_path, &["get", id]);
    assert!(success, "get failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path, _) = setup_test_env();

    let (stdout, _, success) = run_canopy(&config_path, &["init"]);
    assert!(success, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_canopy(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_build_registers_tree() {
    let (_tmp, config_path, doc_path) = setup_test_env();

    let root = build(&config_path, &doc_path);
    let (stdout, _, success) = run_canopy(&config_path, &["trees"]);
    assert!(success);
    assert!(stdout.contains(&root), "trees output: {}", stdout);
    assert!(stdout.contains("notes.md"));

    let root_node = get_json(&config_path, &root);
    assert_eq!(root_node["tier"], "essential");
    assert!(root_node["parent"].is_null());
    assert!(root_node["level"].as_u64().unwrap() >= 1);
}

#[test]
fn test_check_and_show() {
    let (_tmp, config_path, doc_path) = setup_test_env();
    let root = build(&config_path, &doc_path);

    let (stdout, stderr, success) = run_canopy(&config_path, &["check", &root]);
    assert!(success, "check failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("OK"));

    let (stdout, _, success) = run_canopy(&config_path, &["show", &root]);
    assert!(success);
    let first = stdout.lines().next().unwrap();
    assert!(first.contains(&root));
    assert!(stdout.contains("[L0 actionable]"));
    assert!(stdout.contains("segments)"));

    let (shallow, _, success) = run_canopy(&config_path, &["show", &root, "--depth", "0"]);
    assert!(success);
    assert_eq!(shallow.lines().count(), 1);
}

#[test]
fn test_refine_locks_node_and_regenerate_skips_it() {
    let (_tmp, config_path, doc_path) = setup_test_env();
    let root = build(&config_path, &doc_path);

    let root_node = get_json(&config_path, &root);
    let child = root_node["children"][0]
        .as_str()
        .unwrap()
        .strip_prefix("n:")
        .unwrap()
        .to_string();

    let (stdout, stderr, success) = run_canopy(
        &config_path,
        &["refine", &child, "keep only the first point", "--root", &root],
    );
    assert!(success, "refine failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("locked"));

    let refined = get_json(&config_path, &child);
    assert_eq!(refined["locked"], true);
    assert_eq!(refined["edit_log"][0], "keep only the first point");
    assert_eq!(refined["parent"], root.as_str());

    let (stdout, _, success) = run_canopy(&config_path, &["regenerate", &root]);
    assert!(success);
    assert!(stdout.contains("skipped 1 locked"), "regenerate output: {}", stdout);

    let (stdout, _, success) = run_canopy(&config_path, &["check", &root]);
    assert!(success, "check after regenerate failed: {}", stdout);
    assert!(stdout.contains("1 locked"));
}

#[test]
fn test_refine_rejects_blank_instruction() {
    let (_tmp, config_path, doc_path) = setup_test_env();
    let root = build(&config_path, &doc_path);

    let (_, stderr, success) = run_canopy(&config_path, &["refine", &root, "   "]);
    assert!(!success);
    assert!(stderr.contains("blank"), "stderr: {}", stderr);

    let node = get_json(&config_path, &root);
    assert_eq!(node["locked"], false);
}

#[test]
fn test_refine_unknown_node_fails() {
    let (_tmp, config_path, _) = setup_test_env();
    run_canopy(&config_path, &["init"]);

    let (_, stderr, success) = run_canopy(&config_path, &["refine", "no-such-node", "shorter"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_export_writes_nested_json() {
    let (tmp, config_path, doc_path) = setup_test_env();
    let root = build(&config_path, &doc_path);

    let out = tmp.path().join("out").join("tree.json");
    let (_, stderr, success) = run_canopy(
        &config_path,
        &["export", &root, "--output", out.to_str().unwrap()],
    );
    assert!(success, "export failed: {}", stderr);

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(json["id"], root.as_str());

    // Every segment appears exactly once, in document order.
    fn collect(node: &serde_json::Value, out: &mut Vec<u64>) {
        for child in node["children"].as_array().unwrap() {
            match child["kind"].as_str().unwrap() {
                "segment" => out.push(child["index"].as_u64().unwrap()),
                _ => collect(child, out),
            }
        }
    }
    let mut indices = Vec::new();
    collect(&json, &mut indices);
    assert!(indices.len() > 1);
    let expected: Vec<u64> = (0..indices.len() as u64).collect();
    assert_eq!(indices, expected);
}

#[test]
fn test_empty_document_builds_nothing() {
    let (tmp, config_path, _) = setup_test_env();
    let empty = tmp.path().join("files").join("empty.txt");
    fs::write(&empty, "  \n\n  ").unwrap();

    let (_, _, success) = run_canopy(&config_path, &["build", empty.to_str().unwrap()]);
    assert!(!success);

    let (stdout, _, success) = run_canopy(&config_path, &["trees"]);
    assert!(success);
    assert!(stdout.contains("No trees"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _, _) = setup_test_env();
    let bad = tmp.path().join("config").join("bad.toml");
    fs::write(
        &bad,
        format!(
            "[db]\npath = \"{}/data/x.sqlite\"\n\n[grouping]\nmethod = \"random\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_canopy(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown grouping method"), "stderr: {}", stderr);
}
