#![cfg(feature = "cli")]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const SCRIPT: &str = r#"{
  "document_id": "notes",
  "title": "Meeting notes",
  "blocks": [
    { "text": "Hello world" },
    { "text": "Goodbye world" }
  ],
  "edits": [
    { "op": "insert_block", "index": 1, "text": "Middle" },
    { "op": "add_mark", "from": 1, "to": 6, "mark": { "kind": "bold" } },
    { "op": "set_block_kind", "pos": 21, "kind": { "type": "heading", "level": 2 } }
  ]
}"#;

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn run(args: &[&str], script: &Path) -> serde_json::Value {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("fika-replay").unwrap();
    let output = cmd.args(args).arg(script).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_replay_prints_rows_and_reports() {
    let dir = tempdir().unwrap();
    let script = write(dir.path(), "script.json", SCRIPT);
    let json = run(&[], &script);

    assert_eq!(json["document_id"], "notes");
    assert_eq!(json["title"], "Meeting notes");
    let blocks = json["blocks"].as_array().unwrap();
    let ids: Vec<&str> = blocks.iter().map(|block| block["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["b1", "b3", "b2"]);
    assert_eq!(blocks[1]["text"], "Middle");
    assert_eq!(blocks[2]["kind"], "heading");
    assert_eq!(blocks[2]["attrs"]["level"], "2");

    let first = blocks[0]["inlines"].as_array().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["content"], "Hello");
    assert_eq!(first[0]["marks"][0]["kind"], "bold");

    let reports = json["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0]["created"], 2);
    assert_eq!(reports[0]["origin"], "local");
}

#[test]
fn test_replicated_replay_matches_plain_replay() {
    let dir = tempdir().unwrap();
    let script = write(dir.path(), "script.json", SCRIPT);
    let plain = run(&[], &script);
    let replicated = run(&["--replicated"], &script);

    let texts = |json: &serde_json::Value| -> Vec<String> {
        json["blocks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|block| block["text"].as_str().unwrap().to_string())
            .collect()
    };
    assert_eq!(texts(&plain), texts(&replicated));
}

#[test]
fn test_typing_runs_input_rules() {
    let dir = tempdir().unwrap();
    let script = write(
        dir.path(),
        "typing.json",
        r#"{ "blocks": [{ "text": "" }], "edits": [{ "op": "type", "caret": 1, "text": "- milk" }] }"#,
    );
    let json = run(&[], &script);
    assert_eq!(json["document_id"], "doc");
    assert_eq!(json["blocks"][0]["kind"], "bullet_item");
    assert_eq!(json["blocks"][0]["text"], "milk");
}

#[test]
fn test_config_file_sets_the_document() {
    let dir = tempdir().unwrap();
    let script = write(dir.path(), "script.json", r#"{ "blocks": [{ "text": "x" }] }"#);
    let config = write(dir.path(), "config.json", r#"{ "document_id": "from-config" }"#);
    let json = run(&["--config", config.to_str().unwrap()], &script);
    assert_eq!(json["document_id"], "from-config");
    assert_eq!(json["title"], "Untitled");
    assert_eq!(json["reports"].as_array().unwrap().len(), 0);
}

#[test]
#[allow(deprecated)]
fn test_failing_edit_names_its_index() {
    let dir = tempdir().unwrap();
    let script = write(
        dir.path(),
        "bad.json",
        r#"{ "blocks": [{ "text": "ab" }], "edits": [
            { "op": "insert_text", "pos": 2, "text": "ok" },
            { "op": "join_backward", "pos": 1 }
        ] }"#,
    );
    let mut cmd = Command::cargo_bin("fika-replay").unwrap();
    cmd.arg(&script);
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error: edit 1 failed"));
}

#[test]
#[allow(deprecated)]
fn test_missing_script() {
    let mut cmd = Command::cargo_bin("fika-replay").unwrap();
    cmd.arg("does-not-exist.json");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("cannot read does-not-exist.json"));
}
