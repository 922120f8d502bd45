//! Integration tests for the workout binary.
//!
//! These tests verify end-to-end behavior including:
//! - Frame encoding and decoding
//! - Simulated sets through the async engine
//! - Telemetry replay and auto-stop
//! - Session history

use assert_cmd::Command;
use predicates::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// CLI with an isolated config directory so a developer's config never leaks in
fn cli(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("workout"));
    cmd.env("XDG_CONFIG_HOME", temp_dir.path().join("config"))
        .env("RUST_LOG", "warn")
        .arg("--data-dir")
        .arg(temp_dir.path().join("data"));
    cmd
}

/// Three seconds of full-range reps, then six seconds holding still mid-range
fn write_stalling_samples(path: &Path) {
    let mut csv = String::from(
        "timestamp_ms,position_a,position_b,velocity_a,velocity_b,load_a,load_b\n",
    );
    for i in 0..=90u64 {
        let t = i * 100;
        let (pos, vel) = if t <= 3000 {
            (if i % 2 == 0 { 100.0 } else { 500.0 }, 200.0)
        } else {
            (300.0, 0.0)
        };
        writeln!(csv, "{},{},{},{},{},20.0,20.0", t, pos, pos, vel, vel).unwrap();
    }
    fs::write(path, csv).unwrap();
}

#[test]
fn test_cli_help() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Active workout session engine for cable machines",
        ));
}

#[test]
fn test_encode_start_and_stop() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["encode", "start"])
        .assert()
        .success()
        .stdout("03000000\n");
    cli(&temp_dir)
        .args(["encode", "stop"])
        .assert()
        .success()
        .stdout("05000000\n");
}

#[test]
fn test_configure_frame_decodes_back() {
    let temp_dir = setup_test_dir();
    let output = cli(&temp_dir)
        .args(["encode", "configure", "--weight", "32.5", "--reps", "8"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let hex = String::from_utf8(output.stdout).unwrap();
    assert!(hex.starts_with("0401"), "unexpected frame: {}", hex);
    assert_eq!(hex.trim().len(), 64);

    cli(&temp_dir)
        .args(["decode", "command", hex.trim()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configure"))
        .stdout(predicate::str::contains("weight_per_cable_kg: 32.5"))
        .stdout(predicate::str::contains("target_reps: 8"));
}

#[test]
fn test_encode_rejects_unknown_mode() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["encode", "configure", "--mode", "9"])
        .assert()
        .failure();
}

#[test]
fn test_decode_legacy_rep_notification() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["decode", "rep", "01000000 01000000", "--legacy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("up_counter: 1"))
        .stdout(predicate::str::contains("rom: None"));
}

#[test]
fn test_decode_status_ignores_unknown_bits() {
    let temp_dir = setup_test_dir();
    // bit0 ROM high, bit3 deload, bit15 unknown
    cli(&temp_dir)
        .args(["decode", "status", "0980"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rom_outside_high: true"))
        .stdout(predicate::str::contains("deload_occurred: true"))
        .stdout(predicate::str::contains("rom_outside_low: false"));
}

#[test]
fn test_decode_rejects_bad_input() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["decode", "status", "zz"])
        .assert()
        .failure();
    cli(&temp_dir)
        .args(["decode", "rep", "0100"])
        .assert()
        .failure();
}

#[test]
fn test_history_empty() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions recorded yet."));
}

#[test]
fn test_simulate_records_session() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("data");

    cli(&temp_dir)
        .args(["simulate", "--reps", "3", "--warmup", "1", "--exercise", "curl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set complete: 3 working reps (1 warmup)"))
        .stdout(predicate::str::contains("03000000"));

    let sessions = fs::read_to_string(data_dir.join("sessions.jsonl")).unwrap();
    assert_eq!(sessions.lines().count(), 1);
    let record: serde_json::Value = serde_json::from_str(sessions.trim()).unwrap();
    assert_eq!(record["exercise_id"], "curl");
    assert_eq!(record["reason"], "target_reached");
    assert_eq!(record["summary"]["working_reps"], 3);

    let prefs: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(data_dir.join("preferences.json")).unwrap())
            .unwrap();
    assert!(prefs["exercise_defaults"]["curl"].is_object());

    // Default command lists history
    cli(&temp_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("curl @ 20.0 kg: 3 reps"));
}

#[test]
fn test_simulate_reuses_last_used_weight() {
    let temp_dir = setup_test_dir();

    cli(&temp_dir)
        .args(["simulate", "--reps", "2", "--warmup", "0", "--weight", "27.5"])
        .assert()
        .success();
    cli(&temp_dir)
        .args(["simulate", "--reps", "2", "--warmup", "0", "--weight", "40"])
        .assert()
        .success();

    let output = cli(&temp_dir).arg("history").output().unwrap();
    assert!(output.status.success());
    let history = String::from_utf8(output.stdout).unwrap();
    assert_eq!(history.matches("simulated @ 27.5 kg").count(), 2, "{}", history);
    assert!(!history.contains("40.0 kg"));
}

#[test]
fn test_replay_stops_on_velocity_stall() {
    let temp_dir = setup_test_dir();
    let samples = temp_dir.path().join("samples.csv");
    write_stalling_samples(&samples);

    cli(&temp_dir)
        .arg("replay")
        .arg(&samples)
        .assert()
        .success()
        .stdout(predicate::str::contains("VelocityStall"))
        .stdout(predicate::str::contains("Commands: configure, start, stop"));

    let metrics: Vec<_> = fs::read_dir(temp_dir.path().join("data").join("metrics"))
        .unwrap()
        .collect();
    assert_eq!(metrics.len(), 1);
}

#[test]
fn test_replay_fixed_target_is_stopped_at_end_of_data() {
    let temp_dir = setup_test_dir();
    let samples = temp_dir.path().join("samples.csv");
    write_stalling_samples(&samples);

    cli(&temp_dir)
        .arg("replay")
        .arg(&samples)
        .args(["--reps", "5", "--exercise", "row"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Replayed 91 of 91 samples"))
        .stdout(predicate::str::contains("UserStopped"));
}
