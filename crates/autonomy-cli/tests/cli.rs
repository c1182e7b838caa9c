use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_autonomy"))
}

fn autonomy(repo: &Path, home: &Path, args: &[&str]) -> Output {
    bin()
        .env("AUTONOMY_HOME", home)
        .env_remove("AUTONOMY_LOG")
        .env_remove("AUTONOMY_REPO")
        .arg("--root")
        .arg(repo)
        .arg("--repo")
        .arg("acme/app")
        .arg("--actor")
        .arg("dana")
        .args(args)
        .output()
        .expect("run autonomy")
}

fn json_of(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json")
}

fn seed(repo: &Path, home: &Path) {
    let tasks = r#"[
  {"id": "issue-40", "number": 40, "title": "Rotate signing keys", "labels": ["priority-high"],
   "created_at": "2026-09-01T00:00:00Z", "updated_at": "2026-10-18T00:00:00Z"},
  {"id": "issue-41", "number": 41, "title": "Flaky login test", "blocked": true,
   "priority_label": "P0",
   "created_at": "2026-09-01T00:00:00Z", "updated_at": "2026-10-18T00:00:00Z"},
  {"id": "issue-42", "number": 42, "title": "Ship invoice export", "priority_label": "P0",
   "assignee": "dana", "created_at": "2026-10-10T00:00:00Z", "updated_at": "2026-10-18T00:00:00Z"}
]"#;
    let file = repo.join("tasks.json");
    std::fs::write(&file, tasks).expect("write tasks");
    let imported = json_of(&autonomy(
        repo,
        home,
        &["import", file.to_str().expect("utf8 path"), "--json"],
    ));
    assert_eq!(imported["imported"].as_u64(), Some(3));
}

#[test]
fn next_update_undo_round_trip() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    seed(repo.path(), home.path());

    let next = json_of(&autonomy(repo.path(), home.path(), &["next", "--me", "--json"]));
    assert_eq!(next["outcome"].as_str(), Some("next"));
    assert_eq!(next["task"]["task"]["id"].as_str(), Some("issue-42"));
    assert!(next["task"]["explain"]
        .as_str()
        .unwrap_or("")
        .contains("priority_field"));

    let updated = json_of(&autonomy(
        repo.path(),
        home.path(),
        &["update", "42", "--done", "--notes", "exported", "--json"],
    ));
    assert_eq!(updated["outcome"].as_str(), Some("updated"));
    let hash = updated["hash"].as_str().expect("hash").to_string();
    assert_eq!(hash.len(), 64);

    let undone = json_of(&autonomy(
        repo.path(),
        home.path(),
        &["undo", &hash[..8], "--json"],
    ));
    assert_eq!(undone["state"].as_str(), Some("undone"));

    let history = json_of(&autonomy(repo.path(), home.path(), &["history", "--json"]));
    let records = history["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["undone_by"].as_str(), Some("dana"));

    // Undoing again is refused with a non-zero exit.
    let again = autonomy(repo.path(), home.path(), &["undo", &hash]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already undone"));

    let audit = std::fs::read_to_string(repo.path().join(".autonomy").join("audit.log"))
        .expect("audit log");
    assert!(audit.lines().any(|line| line.contains("\"action\":\"update\"")));
    assert!(audit.lines().any(|line| line.contains("\"action\":\"undo\"")));
}

#[test]
fn pin_survives_rerank_and_shows_in_explain() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    seed(repo.path(), home.path());

    let pinned = json_of(&autonomy(repo.path(), home.path(), &["pin", "issue-40", "--json"]));
    assert_eq!(pinned["pinned"].as_bool(), Some(true));

    let rerank = json_of(&autonomy(repo.path(), home.path(), &["rerank", "--json"]));
    let order: Vec<&str> = rerank["order"]
        .as_array()
        .expect("order")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(order, vec!["issue-40", "issue-42", "issue-41"]);

    let explain = autonomy(repo.path(), home.path(), &["explain", "40"]);
    assert!(explain.status.success());
    let text = String::from_utf8_lossy(&explain.stdout);
    assert!(text.contains("pinned: yes, by dana"));
    assert!(text.contains("inferred from legacy label"));
}

#[test]
fn doctor_run_reports_without_writing() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    seed(repo.path(), home.path());

    let report = json_of(&autonomy(repo.path(), home.path(), &["doctor", "run", "--json"]));
    assert_eq!(report["outcome"].as_str(), Some("scanned"));
    assert_eq!(report["report"]["scanned"].as_u64(), Some(3));
    assert!(report["applied"].is_null());

    let history = json_of(&autonomy(repo.path(), home.path(), &["history", "--json"]));
    assert!(history["records"].as_array().expect("records").is_empty());
}

#[test]
fn config_check_reports_sources_and_rejects_bad_weights() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    std::fs::write(
        repo.path().join(".autonomy.toml"),
        "[doctor]\nstale_days = 7\n",
    )
    .expect("config");

    let check = json_of(&autonomy(repo.path(), home.path(), &["config", "check", "--json"]));
    assert_eq!(check["sources"]["doctor"].as_str(), Some("project"));
    assert_eq!(check["sources"]["ranking"].as_str(), Some("default"));
    assert_eq!(check["doctor"]["stale_days"].as_i64(), Some(7));
    assert_eq!(
        check["ranking"]["weights"]["blocked_penalty"].as_f64(),
        Some(-100.0)
    );
    assert_eq!(check["ranking"]["priority_mapping"]["P0"].as_i64(), Some(4));
    assert_eq!(check["ranking"]["max_age_days"].as_u64(), Some(90));

    std::fs::write(
        repo.path().join(".autonomy.toml"),
        concat!(
            "[ranking.weights]\n",
            "priority_field = 5.0\nsprint_proximity = 3.0\n",
            "issue_age = 1.0\nblocked_penalty = -1.0\n",
        ),
    )
    .expect("config");
    let bad = autonomy(repo.path(), home.path(), &["config", "check"]);
    assert!(!bad.status.success());
    assert!(String::from_utf8_lossy(&bad.stderr).contains("blocked_penalty"));
}

#[test]
fn invalid_input_is_rejected_without_state_change() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    seed(repo.path(), home.path());

    let short = autonomy(repo.path(), home.path(), &["undo", "abc"]);
    assert!(!short.status.success());

    let nothing = autonomy(repo.path(), home.path(), &["update", "42"]);
    assert!(!nothing.status.success());

    let missing = autonomy(repo.path(), home.path(), &["pin", "issue-999", "--json"]);
    assert!(!missing.status.success());
    let err: Value = serde_json::from_slice(&missing.stdout).expect("json error");
    assert_eq!(err["ok"].as_bool(), Some(false));
    assert_eq!(err["severity"].as_str(), Some("warning"));

    let history = json_of(&autonomy(repo.path(), home.path(), &["history", "--json"]));
    assert!(history["records"].as_array().expect("records").is_empty());
}

#[test]
fn version_prints_package_version() {
    let output = bin().arg("version").output().expect("version");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.starts_with(&format!("autonomy {}", env!("CARGO_PKG_VERSION"))));
}
