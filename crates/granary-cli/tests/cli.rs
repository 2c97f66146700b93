use std::fs;
use std::process::Command;

use assert_cmd::prelude::*;
use tempfile::TempDir;

fn granary(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("granary").expect("binary built");
    cmd.env("GRANARY_HOME", home.path());
    cmd.env_remove("GRANARY_MIRROR_PATH");
    cmd.env_remove("GRANARY_STORE_PATH");
    cmd
}

#[test]
fn help_lists_the_command_surface() {
    let mut cmd = Command::cargo_bin("granary").expect("binary built");
    let assert = cmd.arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for sub in ["ingest", "stats", "sync", "maintain", "dump", "doctor"] {
        assert!(stdout.contains(sub), "help should mention {sub}");
    }
}

#[test]
fn ingest_stats_and_mark_flow() {
    let home = TempDir::new().expect("temp home");
    let input = home.path().join("page.html");
    fs::write(&input, b"<html>demo</html>").expect("input file");

    let assert = granary(&home)
        .args(["--json", "ingest"])
        .arg(&input)
        .args(["--source", "crawler-7"])
        .assert()
        .success();
    let envelope: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("json envelope");
    assert_eq!(envelope["status"], "Ok");
    let hash = envelope["details"]["records"][0]["hash"]
        .as_str()
        .expect("hash in details")
        .to_string();

    // Re-ingesting the same bytes is the dedup path, still successful.
    granary(&home)
        .arg("ingest")
        .arg(&input)
        .assert()
        .success();

    let assert = granary(&home).args(["--json", "stats"]).assert().success();
    let envelope: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("json envelope");
    assert_eq!(envelope["details"]["total"], 1);
    assert_eq!(envelope["details"]["pending"], 1);

    granary(&home)
        .args(["mark", &hash, "processing"])
        .assert()
        .success();
    granary(&home)
        .args(["mark", &hash, "completed"])
        .assert()
        .success();

    // Out-of-order transitions are user errors, not crashes.
    granary(&home)
        .args(["mark", &hash, "failed"])
        .assert()
        .code(1);

    let assert = granary(&home)
        .args(["--json", "get", &hash])
        .assert()
        .success();
    let envelope: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("json envelope");
    assert_eq!(envelope["details"]["status"], "completed");
}

#[test]
fn unknown_hash_is_a_user_error() {
    let home = TempDir::new().expect("temp home");
    let missing = "0".repeat(64);
    granary(&home)
        .args(["get", missing.as_str()])
        .assert()
        .code(1);
}

#[test]
fn dump_respects_the_record_floor() {
    let home = TempDir::new().expect("temp home");
    let input = home.path().join("only.txt");
    fs::write(&input, b"one record").expect("input file");
    granary(&home).arg("ingest").arg(&input).assert().success();

    // One record is far below the default floor of 100.
    granary(&home).arg("dump").assert().code(1);

    // Lowering the floor lets the export through and writes the pointer.
    granary(&home)
        .env("GRANARY_MIN_RECORDS", "1")
        .arg("dump")
        .assert()
        .success();
    let pointer = home.path().join("dumps").join("latest");
    assert!(pointer.is_file(), "latest pointer written");
}

#[test]
fn sync_without_a_mirror_repo_is_a_user_error() {
    let home = TempDir::new().expect("temp home");
    let assert = granary(&home).args(["--json", "sync"]).assert().code(1);
    let envelope: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("json envelope");
    assert_eq!(envelope["status"], "UserError");
}
