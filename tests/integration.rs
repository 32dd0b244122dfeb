use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn evillens_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_evillens"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Create test exports
    let exports = root.join("exports");
    fs::create_dir_all(&exports).unwrap();
    fs::write(
        exports.join("top.csv"),
        "vd_id,vd_title,author,likes,shares,collects,create_time\n\
         7001,Cartoon #kids #fun,alice,100,10,5,2024-05-01 10:15:00\n\
         7002,Another one #kids,alice,40,2,1,2024-05-01 22:40:00\n\
         7003,No tags here,bob,12.0,0,0,not a date\n",
    )
    .unwrap();
    fs::write(
        exports.join("round.json"),
        r#"{
  "user_info": { "user_id": "u1", "user_name": "alice", "ip_location": "北京" },
  "videos": [
    { "vd_id": "7004", "vd_title": "Round video #kids", "author": "alice", "likes": 3 }
  ]
}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/evillens.sqlite"

[server]
bind = "127.0.0.1:0"

[paths]
inbox_dir = "{root}/inbox"
output_dir = "{root}/output"
rounds_dir = "{root}/rounds"
work_dir = "{root}/tasks"

[analysis]
download_covers = false
min_videos = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("evillens.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_evillens(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = evillens_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run evillens binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn export(config_path: &Path, name: &str) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join("exports").join(name).display().to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_evillens(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_evillens(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_evillens(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_csv() {
    let (_tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let csv = export(&config_path, "top.csv");
    let (stdout, stderr, success) = run_evillens(&config_path, &["ingest", &csv]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rows: 3"));
    assert!(stdout.contains("upserted videos: 3"));
    assert!(stdout.contains("tags linked: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let csv = export(&config_path, "top.csv");

    let (stdout1, _, _) = run_evillens(&config_path, &["ingest", &csv]);
    assert!(stdout1.contains("tags linked: 3"));

    // Re-ingesting links nothing new and leaves the totals alone
    let (stdout2, _, success) = run_evillens(&config_path, &["ingest", &csv]);
    assert!(success);
    assert!(stdout2.contains("upserted videos: 3"));
    assert!(stdout2.contains("tags linked: 0"));

    let (stats, _, _) = run_evillens(&config_path, &["stats"]);
    assert!(stats.contains("Videos:      3"), "stats: {}", stats);
    assert!(stats.contains("Likes:       152"), "stats: {}", stats);
}

#[test]
fn test_ingest_json_with_task_and_archive() {
    let (tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let json = export(&config_path, "round.json");
    let (stdout, stderr, success) = run_evillens(
        &config_path,
        &["ingest", &json, "--task-id", "t-1", "--archive"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("detection rows (t-1): 1"));
    assert!(stdout.contains("archived:"));
    assert!(!Path::new(&json).exists());
    assert!(tmp
        .path()
        .join("inbox")
        .join("processed")
        .join("round.json")
        .exists());
}

#[test]
fn test_report_marks_everything_reported() {
    let (tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let csv = export(&config_path, "top.csv");
    run_evillens(&config_path, &["ingest", &csv]);

    let (stdout, stderr, success) = run_evillens(&config_path, &["report"]);
    assert!(success, "report failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("videos: 3"));
    // No covers were downloaded, so every video counts as taken down
    assert!(stdout.contains("taken down: 3"));
    assert!(tmp.path().join("output").join("evidence_report.md").exists());
    assert!(tmp.path().join("output").join("evidence_report.csv").exists());

    let (again, _, success) = run_evillens(&config_path, &["report"]);
    assert!(success);
    assert!(again.contains("no unreported videos"));

    let (stats, _, _) = run_evillens(&config_path, &["stats"]);
    assert!(stats.contains("Reported:    3"), "stats: {}", stats);
    assert!(stats.contains("Removed:     3"), "stats: {}", stats);
}

#[test]
fn test_check_links_without_media_urls() {
    let (_tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let csv = export(&config_path, "top.csv");
    run_evillens(&config_path, &["ingest", &csv]);

    let (stdout, stderr, success) = run_evillens(&config_path, &["check-links"]);
    assert!(success, "check-links failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("checked: 0"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let (_, stderr, success) = run_evillens(&config_path, &["ingest", "/nonexistent/file.csv"]);
    assert!(!success);
    assert!(stderr.contains("failed to ingest"));
}

#[test]
fn test_ingest_unsupported_extension_fails() {
    let (tmp, config_path) = setup_test_env();

    run_evillens(&config_path, &["init"]);
    let path = tmp.path().join("exports").join("notes.txt");
    fs::write(&path, "hello").unwrap();
    let (_, _, success) = run_evillens(&config_path, &["ingest", path.to_str().unwrap()]);
    assert!(!success);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_evillens(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
