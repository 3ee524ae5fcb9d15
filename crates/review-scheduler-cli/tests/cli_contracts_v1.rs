#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const LEARNER: &str = "01J0SQQP7M70P6Y3R4T8D8G8M2";
const ITEM_A: &str = "01J0SQQP7M70P6Y3R4T8D8G8M3";
const ITEM_B: &str = "01J0SQQP7M70P6Y3R4T8D8G8M4";

fn srs_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_srs"))
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("srs-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn srs_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(srs_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run srs command {:?}: {err}", args),
    }
}

fn srs_ok(db_path: &Path, args: &[&str]) -> Value {
    let output = srs_output(db_path, args);
    assert!(
        output.status.success(),
        "srs {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn cleanup(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(srs_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "track", "untrack", "review", "preview", "due", "progress", "summary", "events", "ladder",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn review_flow_advances_then_demotes() {
    let db_path = temp_db("flow");

    let tracked = srs_ok(
        &db_path,
        &["track", "--learner", LEARNER, "--item", ITEM_A, "--now", "2026-02-07T12:00:00Z"],
    );
    assert_eq!(tracked["level"], Value::String("new".to_string()));
    assert_eq!(
        tracked["next_review_at"],
        Value::String("2026-02-07T16:00:00Z".to_string())
    );

    let advanced = srs_ok(
        &db_path,
        &[
            "review", "--learner", LEARNER, "--item", ITEM_A, "--outcome", "correct",
            "--latency-ms", "1200", "--now", "2026-02-07T16:00:00Z",
        ],
    );
    assert_eq!(advanced["level"], Value::String("learning_1".to_string()));
    assert_eq!(
        advanced["next_review_at"],
        Value::String("2026-02-08T00:00:00Z".to_string())
    );
    assert_eq!(advanced["revision"], Value::Number(1_u64.into()));

    let demoted = srs_ok(
        &db_path,
        &[
            "review", "--learner", LEARNER, "--item", ITEM_A, "--outcome", "incorrect",
            "--now", "2026-02-08T00:00:00Z",
        ],
    );
    assert_eq!(demoted["level"], Value::String("new".to_string()));
    assert_eq!(demoted["incorrect_total"], Value::Number(1_u64.into()));
    assert_eq!(demoted["consecutive_correct"], Value::Number(0_u64.into()));

    let shown = srs_ok(
        &db_path,
        &["progress", "show", "--learner", LEARNER, "--item", ITEM_A],
    );
    assert_eq!(shown, demoted);

    let events = srs_ok(
        &db_path,
        &["events", "list", "--learner", LEARNER, "--item", ITEM_A],
    );
    let transitions = events
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|event| event["transition"].clone())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(
        transitions,
        vec![
            Value::String("advanced".to_string()),
            Value::String("demoted".to_string())
        ]
    );

    cleanup(&db_path);
}

#[test]
fn preview_reports_both_branches_without_writing() {
    let db_path = temp_db("preview");
    srs_ok(
        &db_path,
        &["track", "--learner", LEARNER, "--item", ITEM_A, "--now", "2026-02-07T12:00:00Z"],
    );

    let preview = srs_ok(
        &db_path,
        &[
            "preview", "--learner", LEARNER, "--item", ITEM_A, "--as-of",
            "2026-02-07T16:00:00Z",
        ],
    );
    assert_eq!(
        preview["on_correct"]["level"],
        Value::String("learning_1".to_string())
    );
    assert_eq!(
        preview["on_incorrect"]["transition"],
        Value::String("floored".to_string())
    );

    let shown = srs_ok(
        &db_path,
        &["progress", "show", "--learner", LEARNER, "--item", ITEM_A],
    );
    assert_eq!(shown["revision"], Value::Number(0_u64.into()));

    cleanup(&db_path);
}

#[test]
fn due_lists_only_due_items_in_order() {
    let db_path = temp_db("due");
    srs_ok(
        &db_path,
        &["track", "--learner", LEARNER, "--item", ITEM_A, "--now", "2026-02-07T12:00:00Z"],
    );
    srs_ok(
        &db_path,
        &["track", "--learner", LEARNER, "--item", ITEM_B, "--now", "2026-02-07T10:00:00Z"],
    );

    let early = srs_ok(
        &db_path,
        &["due", "--learner", LEARNER, "--now", "2026-02-07T15:00:00Z"],
    );
    assert_eq!(early.as_array().map(Vec::len), Some(1));
    assert_eq!(early[0]["item_id"], Value::String(ITEM_B.to_string()));

    let later = srs_ok(
        &db_path,
        &["due", "--learner", LEARNER, "--now", "2026-02-07T18:00:00Z"],
    );
    let items = later
        .as_array()
        .map(|records| {
            records
                .iter()
                .map(|record| record["item_id"].clone())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(
        items,
        vec![
            Value::String(ITEM_B.to_string()),
            Value::String(ITEM_A.to_string())
        ]
    );

    let table = srs_output(
        &db_path,
        &[
            "due", "--learner", LEARNER, "--now", "2026-02-07T18:00:00Z", "--format", "table",
        ],
    );
    assert!(table.status.success());
    let stdout = String::from_utf8_lossy(&table.stdout);
    assert!(stdout.contains("next_review_at"));
    assert!(stdout.contains(ITEM_A));

    let zero = srs_output(&db_path, &["due", "--learner", LEARNER, "--limit", "0"]);
    assert!(!zero.status.success());
    let stderr = String::from_utf8_lossy(&zero.stderr);
    assert!(stderr.contains("limit"), "unexpected stderr={stderr}");

    cleanup(&db_path);
}

#[test]
fn error_shape_for_untracked_pair_is_stable() {
    let db_path = temp_db("missing");
    let output = srs_output(
        &db_path,
        &["review", "--learner", LEARNER, "--item", ITEM_A, "--outcome", "correct"],
    );
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no progress record"),
        "expected stable error shape, got stderr={stderr}"
    );

    cleanup(&db_path);
}

#[test]
fn invalid_outcome_is_rejected_by_argument_parsing() {
    let db_path = temp_db("bad-outcome");
    let output = srs_output(
        &db_path,
        &["review", "--learner", LEARNER, "--item", ITEM_A, "--outcome", "partial"],
    );
    assert!(!output.status.success());
    assert!(!db_path.exists());
}

#[test]
fn custom_ladder_file_drives_intervals() {
    let db_path = temp_db("ladder");
    let ladder_path =
        std::env::temp_dir().join(format!("srs-contract-ladder-{}.json", Ulid::new()));

    let mut ladder = srs_ok(&db_path, &["ladder", "show"]);
    ladder["levels"][0]["interval_seconds"] = Value::Number(60_u64.into());
    if let Err(err) = std::fs::write(&ladder_path, ladder.to_string()) {
        panic!("failed to write ladder file: {err}");
    }
    let ladder_arg = ladder_path.to_string_lossy().to_string();

    let output = Command::new(srs_binary_path())
        .arg("--db")
        .arg(&db_path)
        .args(["--ladder", &ladder_arg])
        .args(["track", "--learner", LEARNER, "--item", ITEM_A])
        .args(["--now", "2026-02-07T12:00:00Z"])
        .output();
    let output = match output {
        Ok(value) => value,
        Err(err) => panic!("failed to run srs with ladder: {err}"),
    };
    assert!(output.status.success());
    assert_eq!(
        stdout_json(&output)["next_review_at"],
        Value::String("2026-02-07T12:01:00Z".to_string())
    );

    ladder["levels"][0]["interval_seconds"] = Value::Number(0_u64.into());
    if let Err(err) = std::fs::write(&ladder_path, ladder.to_string()) {
        panic!("failed to write ladder file: {err}");
    }
    let rejected = match Command::new(srs_binary_path())
        .args(["--ladder", &ladder_arg, "ladder", "show"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run srs with bad ladder: {err}"),
    };
    assert!(!rejected.status.success());
    let stderr = String::from_utf8_lossy(&rejected.stderr);
    assert!(stderr.contains("interval_seconds"), "unexpected stderr={stderr}");

    ladder["levels"][0]["interval_seconds"] = Value::Number(60_u64.into());
    ladder["levels"][7]["interval_seconds"] = Value::Number((i64::MAX / 2).into());
    if let Err(err) = std::fs::write(&ladder_path, ladder.to_string()) {
        panic!("failed to write ladder file: {err}");
    }
    let oversized = match Command::new(srs_binary_path())
        .args(["--ladder", &ladder_arg, "ladder", "show"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run srs with oversized ladder: {err}"),
    };
    assert!(!oversized.status.success());
    let stderr = String::from_utf8_lossy(&oversized.stderr);
    assert!(stderr.contains("mastered"), "unexpected stderr={stderr}");

    cleanup(&db_path);
    let _ = std::fs::remove_file(&ladder_path);
}
