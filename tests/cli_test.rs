use std::process::Command;

use beat_keeper::AppConfig;
use serde_json::Value;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_beat_keeper_cli"))
}

#[test]
fn dump_config_prints_defaults() {
    let output = cli()
        .arg("dump-config")
        .output()
        .expect("failed to run beat_keeper_cli dump-config");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let config: AppConfig = serde_json::from_str(stdout.trim()).expect("config JSON");
    assert_eq!(config, AppConfig::default());
}

#[test]
fn synth_reports_tracked_performance() {
    let output = cli()
        .args(["synth", "--bpm", "100", "--bars", "4"])
        .output()
        .expect("failed to run beat_keeper_cli synth");
    assert!(
        output.status.success(),
        "CLI exited with {:?}",
        output.status.code()
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout UTF-8");
    let json: Value = serde_json::from_str(stdout.trim()).expect("replay report JSON");
    assert_eq!(json["starts"], 1);
    assert_eq!(json["stops"], 1);
    assert_eq!(json["onsets"].as_array().map(Vec::len), Some(16));
    let bpm = json["final_bpm"].as_f64().unwrap_or_default();
    assert!((bpm - 100.0).abs() < 0.5, "final tempo {bpm}");
}

#[test]
fn replay_missing_wav_fails() {
    let output = cli()
        .args(["replay", "--wav", "/nonexistent/take.wav", "--bpm", "120"])
        .output()
        .expect("failed to run beat_keeper_cli replay");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr UTF-8");
    assert!(stderr.contains("Error"), "stderr: {stderr}");
}
