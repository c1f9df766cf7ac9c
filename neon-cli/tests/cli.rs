//! End-to-end exercises of the `neon-cli` binary itself, not just the
//! library logic `neond` already covers: argument parsing, the on-disk
//! status/control file formats, and the operator-facing output.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cli() -> Command {
    Command::cargo_bin("neon-cli").unwrap()
}

#[test]
fn status_without_a_running_daemon_reports_a_helpful_error() {
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status.json");
    cli()
        .arg("--status-path")
        .arg(&status_path)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("is neond running?"));
}

#[test]
fn status_reads_back_a_snapshot_neond_would_have_written() {
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status.json");
    let snapshot = serde_json::json!({
        "pid": 1234,
        "devices": [{
            "name": "Tesla GTX275",
            "policy": "fcfs",
            "channel_count": 40,
            "live_channels": 2,
            "task_count": 1,
            "holder": null,
            "season": null,
            "device_vtime_ms": null,
        }],
        "metrics": {
            "submit_total": 10,
            "issue_total": 10,
            "complete_total": 8,
            "poll_ticks_total": 500,
            "malicious_kills_total": 0,
            "avg_poll_tick_micros": 12,
            "uptime_seconds": 5,
        },
    });
    let mut f = std::fs::File::create(&status_path).unwrap();
    write!(f, "{snapshot}").unwrap();

    cli()
        .arg("--status-path")
        .arg(&status_path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("neond pid: 1234"))
        .stdout(predicate::str::contains("Tesla GTX275"))
        .stdout(predicate::str::contains("40 total, 2 live"));
}

#[test]
fn status_json_flag_prints_the_raw_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status.json");
    std::fs::write(&status_path, r#"{"pid":1,"devices":[],"metrics":{"submit_total":0,"issue_total":0,"complete_total":0,"poll_ticks_total":0,"malicious_kills_total":0,"avg_poll_tick_micros":0,"uptime_seconds":0}}"#).unwrap();

    cli()
        .arg("--status-path")
        .arg(&status_path)
        .arg("status")
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pid\": 1"));
}

#[test]
fn set_enqueues_a_knob_update_onto_the_control_file() {
    let dir = tempfile::tempdir().unwrap();
    let control_path = dir.path().join("control.json");

    cli()
        .arg("--control-path")
        .arg(&control_path)
        .arg("set")
        .arg("polling-t")
        .arg("7")
        .assert()
        .success()
        .stdout(predicate::str::contains("queued"));

    let body = std::fs::read_to_string(&control_path).unwrap();
    let updates: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(updates[0]["name"], "polling_t");
    assert_eq!(updates[0]["value"], 7);
}

#[test]
fn set_appends_without_clobbering_an_earlier_queued_update() {
    let dir = tempfile::tempdir().unwrap();
    let control_path = dir.path().join("control.json");

    cli().arg("--control-path").arg(&control_path).arg("set").arg("sampling-x").arg("3").assert().success();
    cli().arg("--control-path").arg(&control_path).arg("set").arg("disengage").arg("false").assert().success();

    let body = std::fs::read_to_string(&control_path).unwrap();
    let updates: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(updates.as_array().unwrap().len(), 2);
    assert_eq!(updates[0]["name"], "sampling_x");
    assert_eq!(updates[1]["name"], "disengage");
}

#[test]
fn rejects_an_unknown_policy_kind() {
    let dir = tempfile::tempdir().unwrap();
    let control_path = dir.path().join("control.json");
    cli()
        .arg("--control-path")
        .arg(&control_path)
        .arg("set")
        .arg("policy")
        .arg("round-robin")
        .assert()
        .failure();
}
