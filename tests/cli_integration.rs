// CLI integration tests for create/info/feed/drain flows.
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_mpsclog");
    Command::new(exe)
}

fn json_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json"))
        .collect()
}

fn run(args: &[&str]) -> Output {
    cmd().args(args).output().expect("run")
}

fn create(path: &Path, capacity: &str) {
    let out = run(&["create", path.to_str().unwrap(), "--capacity", capacity]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

fn records(lines: &[Value]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.get("record").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[test]
fn create_then_info_reports_geometry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");

    let out = run(&["create", path.to_str().unwrap(), "--capacity", "8192"]);
    assert!(out.status.success());
    let created = &json_lines(&out.stdout)[0];
    assert_eq!(created["capacity"], 8192);
    assert!(created["path"].as_str().unwrap().ends_with("events.log"));

    let out = run(&["info", path.to_str().unwrap()]);
    assert!(out.status.success());
    let info = &json_lines(&out.stdout)[0];
    assert_eq!(info["capacity"], 8192);
    assert_eq!(info["consumed_offset"], 0);
    assert!(info["journal_size"].as_u64().unwrap() > 0);
}

#[test]
fn feed_then_drain_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    create(&path, "8192");

    let out = run(&["feed", path.to_str().unwrap(), "alpha", "beta", "gamma"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let lines = json_lines(&out.stdout);
    let summary = lines.last().expect("summary");
    assert_eq!(summary["appended"], 3);
    assert_eq!(summary["delivered"], 0);

    let out = run(&["drain", path.to_str().unwrap()]);
    assert!(out.status.success());
    let lines = json_lines(&out.stdout);
    assert_eq!(records(&lines), vec!["alpha", "beta", "gamma"]);
    assert_eq!(lines.last().unwrap()["delivered"], 3);

    let out = run(&["drain", path.to_str().unwrap()]);
    assert_eq!(json_lines(&out.stdout).last().unwrap()["delivered"], 0);
}

#[test]
fn feed_delivers_leftovers_before_appending() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    create(&path, "8192");

    assert!(run(&["feed", path.to_str().unwrap(), "first"]).status.success());
    let out = run(&["feed", path.to_str().unwrap(), "second"]);
    assert!(out.status.success());
    let lines = json_lines(&out.stdout);
    assert_eq!(records(&lines), vec!["first"]);
    assert_eq!(lines.last().unwrap()["delivered"], 1);
    assert_eq!(lines.last().unwrap()["appended"], 1);
}

#[test]
fn feed_reads_stdin_with_several_workers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    create(&path, "65536");

    let mut child = cmd()
        .args(["feed", path.to_str().unwrap(), "--workers", "3"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn");
    {
        let mut stdin = child.stdin.take().expect("stdin");
        for i in 0..30 {
            writeln!(stdin, "line {i}").expect("write");
        }
    }
    let out = child.wait_with_output().expect("wait");
    assert!(out.status.success());
    assert_eq!(json_lines(&out.stdout).last().unwrap()["appended"], 30);

    let out = run(&["drain", path.to_str().unwrap()]);
    let mut got = records(&json_lines(&out.stdout));
    got.sort();
    let mut expected: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
    expected.sort();
    assert_eq!(got, expected);
}

#[test]
fn full_log_reports_busy_with_drain_hint() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    create(&path, "256");

    let out = run(&["feed", path.to_str().unwrap(), "a", "b", "c", "d", "e"]);
    assert!(!out.status.success());
    let err = &json_lines(&out.stderr)[0]["error"];
    assert_eq!(err["kind"], "Busy");
    assert!(err["hint"].as_str().unwrap().contains("drain"));
    let message = err["message"].as_str().unwrap();
    assert!(message.contains("appended 3 of 5"), "{message}");

    // Records appended before the log filled up are kept.
    let out = run(&["drain", path.to_str().unwrap()]);
    assert_eq!(records(&json_lines(&out.stdout)), vec!["a", "b", "c"]);
}

#[test]
fn missing_file_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("absent.log");
    let out = run(&["info", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(3));
    let err = &json_lines(&out.stderr)[0]["error"];
    assert_eq!(err["kind"], "NotFound");
}

#[test]
fn bad_capacity_is_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("events.log");
    let out = run(&["create", path.to_str().unwrap(), "--capacity", "100"]);
    assert_eq!(out.status.code(), Some(2));
    let err = &json_lines(&out.stderr)[0]["error"];
    assert_eq!(err["kind"], "Usage");
}
