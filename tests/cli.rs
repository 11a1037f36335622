//! Drives the `corpus` binary end to end against a temporary workspace.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn corpus_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("corpus");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let notes = root.join("notes");
    fs::create_dir_all(notes.join("sub")).unwrap();
    fs::write(
        notes.join("alpha.md"),
        "# Alpha\n\nNotes about the alpha release and its migration steps.",
    )
    .unwrap();
    fs::write(
        notes.join("sub/beta.txt"),
        "Beta plain text covering deployment windows and rollback plans.",
    )
    .unwrap();
    fs::write(notes.join("ignored.rs"), "fn main() {}").unwrap();

    fs::write(
        root.join("feed.jsonl"),
        concat!(
            r#"{"id": "a", "text": "First feed entry about tide tables and harbor schedules."}"#,
            "\n",
            r#"{"id": "b", "text": "Second feed entry describing mountain weather stations."}"#,
            "\n",
            "\n",
            r#"{"id": "c", "text": "Third feed entry on regional rail timetable changes."}"#,
            "\n",
        ),
    )
    .unwrap();

    let config_path = root.join("corpus.toml");
    write_config(&config_path, &root, "");
    (tmp, config_path)
}

fn write_config(path: &Path, root: &Path, extra: &str) {
    let root = root.display();
    let content = format!(
        r#"[db]
path = "{root}/data/ledger.sqlite"

[staging]
root = "{root}/data/staging"

[output]
dir = "{root}/data/output"

[orchestration]
project_start = "2020-01-01"

[sources.notes]
kind = "filesystem"
root = "{root}/notes"

[sources.feed]
kind = "jsonl"
path = "{root}/feed.jsonl"
{extra}"#
    );
    fs::write(path, content).unwrap();
}

fn corpus(config: &Path, args: &[&str]) -> Output {
    Command::new(corpus_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run corpus binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn run_json(config: &Path, args: &[&str]) -> (Output, serde_json::Value) {
    let mut full = vec!["run"];
    full.extend_from_slice(args);
    full.push("--json");
    let output = corpus(config, &full);
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "run output is not JSON ({}): {}\nstderr: {}",
            e,
            stdout(&output),
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (output, report)
}

fn outcome<'a>(report: &'a serde_json::Value, source: &str) -> &'a serde_json::Value {
    report["sources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["source"] == source)
        .unwrap_or_else(|| panic!("no outcome for {}", source))
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    for _ in 0..2 {
        let output = corpus(&config, &["init"]);
        assert!(output.status.success());
        assert!(stdout(&output).contains("Ledger initialized successfully."));
    }
}

#[test]
fn test_sources_lists_configured_sources() {
    let (_tmp, config) = setup_test_env();
    let output = corpus(&config, &["sources"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("notes"));
    assert!(text.contains("filesystem"));
    assert!(text.contains("feed"));
    assert!(text.contains("jsonl"));
}

#[test]
fn test_run_then_cadence_skip() {
    let (tmp, config) = setup_test_env();

    let (output, report) = run_json(&config, &[]);
    assert!(output.status.success());
    let notes = outcome(&report, "notes");
    assert_eq!(notes["status"], "success");
    assert_eq!(notes["reason"], "first_run");
    assert_eq!(notes["metrics"]["processed"], 2);
    let feed = outcome(&report, "feed");
    assert_eq!(feed["status"], "success");
    assert_eq!(feed["metrics"]["processed"], 3);

    let written = fs::read_to_string(tmp.path().join("data/output/feed.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 3);
    let first: serde_json::Value = serde_json::from_str(written.lines().next().unwrap()).unwrap();
    assert_eq!(first["source"], "feed");
    assert_eq!(first["key"], "a");
    assert!(tmp.path().join("data/output/notes.jsonl").exists());

    let (output, report) = run_json(&config, &[]);
    assert!(output.status.success());
    assert_eq!(outcome(&report, "notes")["status"], "skipped");
    assert_eq!(outcome(&report, "notes")["reason"], "refresh_not_due");
    assert_eq!(outcome(&report, "feed")["status"], "skipped");
}

#[test]
fn test_forced_rerun_writes_nothing_new() {
    let (tmp, config) = setup_test_env();
    run_json(&config, &["notes"]);

    let (output, report) = run_json(&config, &["notes", "--force"]);
    assert!(output.status.success());
    let notes = outcome(&report, "notes");
    assert_eq!(notes["reason"], "forced");
    assert_eq!(notes["metrics"]["processed"], 0);
    assert_eq!(notes["metrics"]["exact_duplicates"], 2);
    assert!(outcome_missing(&report, "feed"));

    let written = fs::read_to_string(tmp.path().join("data/output/notes.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 2);
}

fn outcome_missing(report: &serde_json::Value, source: &str) -> bool {
    report["sources"]
        .as_array()
        .unwrap()
        .iter()
        .all(|o| o["source"] != source)
}

#[test]
fn test_limit_and_checkpoint_commands() {
    let (_tmp, config) = setup_test_env();

    let (_, report) = run_json(&config, &["feed", "--limit", "feed=2"]);
    assert_eq!(outcome(&report, "feed")["metrics"]["processed"], 2);

    let output = corpus(&config, &["checkpoint", "show", "feed"]);
    assert!(output.status.success());
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(shown["checkpoint"]["last_offset"], 2);
    assert!(shown["completion"].is_null());

    let (_, report) = run_json(&config, &["feed", "--force"]);
    let feed = outcome(&report, "feed");
    assert_eq!(feed["status"], "success");

    let output = corpus(&config, &["checkpoint", "show", "feed"]);
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(shown["checkpoint"].is_null());
    assert_eq!(shown["completion"]["final_offset"], 4);

    let output = corpus(&config, &["checkpoint", "clear", "feed"]);
    assert!(output.status.success());
    let output = corpus(&config, &["checkpoint", "show", "feed"]);
    let shown: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(shown["checkpoint"].is_null());
    assert!(shown["completion"].is_null());
}

#[test]
fn test_status_and_reset() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &[]);

    let output = corpus(&config, &["status"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("notes"));
    assert!(text.contains("feed"));
    assert!(text.contains("steady state"));

    let output = corpus(&config, &["reset", "feed", "--key", "b"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Reset feed/b to discovered."));

    let output = corpus(&config, &["reset", "feed", "--key", "zzz"]);
    assert!(!output.status.success());

    let output = corpus(&config, &["reset", "notes"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Deleted 2 records of notes"));

    let (_, report) = run_json(&config, &["notes"]);
    // Cadence still applies after a reset; the run history is kept.
    assert_eq!(outcome(&report, "notes")["status"], "skipped");
}

#[test]
fn test_unknown_source_is_an_error() {
    let (_tmp, config) = setup_test_env();

    let output = corpus(&config, &["run", "nope"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown source: 'nope'"));

    let output = corpus(&config, &["status", "nope"]);
    assert!(!output.status.success());

    let output = corpus(&config, &["checkpoint", "show", "nope"]);
    assert!(!output.status.success());
}

#[test]
fn test_failing_source_sets_exit_code() {
    let (tmp, config) = setup_test_env();
    write_config(
        &config,
        tmp.path(),
        &format!(
            "\n[sources.broken]\nkind = \"jsonl\"\npath = \"{}/missing.jsonl\"\n",
            tmp.path().display()
        ),
    );

    let (output, report) = run_json(&config, &[]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(outcome(&report, "broken")["status"], "failed");
    assert_eq!(outcome(&report, "notes")["status"], "success");
    assert_eq!(outcome(&report, "feed")["status"], "success");
}

#[test]
fn test_repeated_jsonl_id_does_not_fail_source() {
    let (tmp, config) = setup_test_env();
    fs::write(
        tmp.path().join("corp.jsonl"),
        concat!(
            r#"{"id": "p1", "text": "Harbor pilots report calm water along the northern channel."}"#,
            "\n",
            r#"{"id": "p2", "text": "The orchard co-op published this season's apple yields."}"#,
            "\n",
            r#"{"id": "p1", "text": "Harbor pilots report calm water along the northern channel."}"#,
            "\n",
            r#"{"id": "p3", "text": "Library hours change for the winter holidays next month."}"#,
            "\n",
        ),
    )
    .unwrap();
    write_config(
        &config,
        tmp.path(),
        &format!(
            "\n[sources.corp]\nkind = \"jsonl\"\npath = \"{}/corp.jsonl\"\n",
            tmp.path().display()
        ),
    );

    let (output, report) = run_json(&config, &["corp"]);
    assert!(output.status.success());
    let corp = outcome(&report, "corp");
    assert_eq!(corp["status"], "success");
    assert_eq!(corp["metrics"]["processed"], 3);
    assert_eq!(corp["metrics"]["skipped_known"], 1);

    let written = fs::read_to_string(tmp.path().join("data/output/corp.jsonl")).unwrap();
    let keys: Vec<String> = written
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["key"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["p1", "p2", "p3"]);
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, config) = setup_test_env();
    write_config(&config, tmp.path(), "cadence_days = 0\n");
    let output = corpus(&config, &["sources"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cadence_days"));
}
