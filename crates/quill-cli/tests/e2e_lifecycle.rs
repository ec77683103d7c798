//! E2E CLI tests covering the attempt lifecycle:
//! - `quill init` project layout
//! - `quill attempt create/list/show/finish/delete`
//! - `quill ingest` with duplicates and out-of-order batches
//! - `quill events`, `quill replay`, `quill metrics`, `quill verify`
//!
//! Each test runs the `quill` binary as a subprocess in an isolated temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

/// Build a Command targeting the quill binary, rooted in `dir`.
fn quill_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("quill"));
    cmd.current_dir(dir);
    cmd.env("QUILL_LOG", "error");
    cmd.env_remove("QUILL_DB");
    cmd.env_remove("FORMAT");
    cmd
}

fn init_project(dir: &Path) {
    quill_cmd(dir).args(["init"]).assert().success();
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let output = quill_cmd(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("quill should not crash");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("--json should produce valid JSON")
}

/// Create an attempt with a `main.py` starter, return its id.
fn create_attempt(dir: &Path, starter: &str) -> i64 {
    let starter_path = dir.join("starter.py");
    std::fs::write(&starter_path, starter).expect("write starter");
    let arg = format!("main.py={}", starter_path.display());
    let json = run_json(
        dir,
        &["attempt", "create", "--assignment", "hw1", "--file", &arg],
    );
    json["id"].as_i64().expect("attempt id")
}

fn edit(seq: u64, t: f64, code: &str) -> Value {
    json!({
        "t": t,
        "seq": seq,
        "type": "edit",
        "file_path": "main.py",
        "payload_json": json!({"fullCode": code, "charsAdded": 1}).to_string(),
    })
}

fn event(seq: u64, t: f64, kind: &str, payload: &Value) -> Value {
    json!({"t": t, "seq": seq, "type": kind, "payload_json": payload.to_string()})
}

fn ingest(dir: &Path, batch: &Value) -> Value {
    let path = dir.join("batch.json");
    std::fs::write(&path, batch.to_string()).expect("write batch");
    run_json(dir, &["ingest", path.to_str().expect("utf-8 path")])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn init_creates_project_layout() {
    let dir = TempDir::new().expect("tempdir");
    let json = run_json(dir.path(), &["init"]);
    assert!(json["store"].as_str().is_some_and(|s| s.ends_with("ledger.sqlite3")));
    assert!(dir.path().join(".quill/config.toml").is_file());
    assert!(dir.path().join(".quill/.gitignore").is_file());

    quill_cmd(dir.path())
        .args(["init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    quill_cmd(dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn full_session_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let id = create_attempt(dir.path(), "");

    // Second batch arrives first.
    let late = ingest(
        dir.path(),
        &json!({"attemptId": id, "events": [
            event(3, 4.0, "paste", &json!({"size": 250})),
            edit(4, 6.0, "print('hi')\nx = 1"),
        ]}),
    );
    assert_eq!(late["inserted"], 2);

    let early = ingest(
        dir.path(),
        &json!({"attempt_id": id, "events": [
            edit(1, 1.0, "p"),
            edit(2, 2.0, "print('hi')"),
        ]}),
    );
    assert_eq!(early["inserted"], 2);

    // Full resend is acknowledged without new rows.
    let resend = ingest(
        dir.path(),
        &json!({"attempt_id": id, "events": [edit(1, 1.0, "p"), edit(2, 2.0, "print('hi')")]}),
    );
    assert_eq!(resend["inserted"], 0);
    assert_eq!(resend["duplicates"], 2);

    let events = run_json(dir.path(), &["events", &id.to_string()]);
    let seqs: Vec<u64> = events
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|e| e["seq"].as_u64())
        .collect();
    assert_eq!(seqs, [1, 2, 3, 4]);

    let page = run_json(
        dir.path(),
        &["events", &id.to_string(), "--after", "2", "--limit", "1"],
    );
    assert_eq!(page.as_array().map(Vec::len), Some(1));
    assert_eq!(page[0]["seq"], 3);

    let at_two = run_json(dir.path(), &["replay", &id.to_string(), "--seq", "2"]);
    assert_eq!(at_two["files"]["main.py"], "print('hi')");

    let start = run_json(dir.path(), &["replay", &id.to_string(), "--seq", "0"]);
    assert_eq!(start["files"]["main.py"], "");

    let last = run_json(dir.path(), &["replay", &id.to_string()]);
    assert_eq!(last["at_sequence"], 4);
    assert_eq!(last["files"]["main.py"], "print('hi')\nx = 1");

    let metrics = run_json(dir.path(), &["metrics", &id.to_string()]);
    assert_eq!(metrics["attemptId"], id);
    assert_eq!(metrics["pasteCount"], 1);
    assert_eq!(metrics["largePasteCount"], 1);
    assert_eq!(metrics["eventCount"], 4);
    assert_eq!(metrics["finished"], false);

    let final_path = dir.path().join("final.py");
    std::fs::write(&final_path, "print('hi')\nx = 1").expect("write final");
    let finished = run_json(
        dir.path(),
        &[
            "attempt",
            "finish",
            &id.to_string(),
            "--file",
            &format!("main.py={}", final_path.display()),
        ],
    );
    assert!(finished["gaps"].as_array().is_some_and(Vec::is_empty));

    let verify = run_json(dir.path(), &["verify", &id.to_string()]);
    assert_eq!(verify["clean"], true);
    assert_eq!(verify["attempts"][0]["final_state"]["status"], "matches");
}

#[test]
fn replay_steps_skip_noop_edits() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let id = create_attempt(dir.path(), "");

    ingest(
        dir.path(),
        &json!({"attempt_id": id, "events": [
            edit(1, 1.0, "a"),
            edit(2, 2.0, "a"),
            event(3, 3.0, "run", &json!({})),
            edit(4, 4.0, "ab"),
        ]}),
    );

    let steps = run_json(dir.path(), &["replay", &id.to_string(), "--steps"]);
    let seqs: Vec<u64> = steps
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|s| s["sequence"].as_u64())
        .collect();
    assert_eq!(seqs, [1, 3, 4]);

    let step_two = run_json(dir.path(), &["replay", &id.to_string(), "--step", "2"]);
    assert_eq!(step_two["at_sequence"], 4);
    assert_eq!(step_two["step"], 2);
}

#[test]
fn attempt_list_filters_and_counts_events() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let first = create_attempt(dir.path(), "");
    run_json(dir.path(), &["attempt", "create", "--assignment", "hw2"]);

    ingest(
        dir.path(),
        &json!({"attempt_id": first, "events": [edit(1, 0.5, "x")]}),
    );

    let all = run_json(dir.path(), &["attempt", "list"]);
    assert_eq!(all.as_array().map(Vec::len), Some(2));

    let hw1 = run_json(dir.path(), &["attempt", "list", "--assignment", "hw1"]);
    assert_eq!(hw1.as_array().map(Vec::len), Some(1));
    assert_eq!(hw1[0]["id"], first);
    assert_eq!(hw1[0]["event_count"], 1);

    let shown = run_json(dir.path(), &["attempt", "show", &first.to_string()]);
    assert_eq!(shown["event_count"], 1);

    run_json(dir.path(), &["attempt", "delete", &first.to_string()]);
    let after = run_json(dir.path(), &["attempt", "list"]);
    assert_eq!(after.as_array().map(Vec::len), Some(1));
}

#[test]
fn text_mode_is_line_oriented() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let id = create_attempt(dir.path(), "");
    ingest(
        dir.path(),
        &json!({"attempt_id": id, "events": [edit(1, 0.5, "x")]}),
    );

    quill_cmd(dir.path())
        .args(["events", &id.to_string(), "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("SEQ\tT\tTYPE"));

    quill_cmd(dir.path())
        .args(["metrics", &id.to_string(), "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("event_count=1"));
}

#[test]
fn jsonl_ingest_from_stdin() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let id = create_attempt(dir.path(), "");

    let lines = [
        json!({"attempt_id": id, "events": [edit(1, 0.5, "x")]}).to_string(),
        json!({"attempt_id": id, "events": [edit(2, 0.9, "xy")]}).to_string(),
    ]
    .join("\n");

    let output = quill_cmd(dir.path())
        .args(["ingest", "-", "--json"])
        .write_stdin(lines)
        .output()
        .expect("ingest");
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["batches"], 2);
    assert_eq!(json["inserted"], 2);
}
