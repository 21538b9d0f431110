use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

const VALID_CONFIG: &str = r#"
[camera]
index = 0
frame_width = 640
frame_height = 480

[model]
model_path = "models/sorter.onnx"
min_confidence = 0.5
fallback_category = "other"
max_inference_time_ms = 500

[belt]
belt_speed_mps = 0.15
motor_pin_bcm = 26
min_duty_cycle = 20.0
max_duty_cycle = 100.0
accel_time_s = 0.0
decel_time_s = 0.0

[belt.distances_m]
metal = 0.60
plastic = 0.80

[trigger]
pin_bcm = 17
debounce_ms = 50

[bins.metal]
trigger_pin_bcm = 5
echo_pin_bcm = 6
empty_distance_m = 1.0
full_distance_m = 0.1

[diverters.metal]
kind = "stepper"
step_pin_bcm = 23
dir_pin_bcm = 24
steps_per_activation = 200

[diverters.plastic]
kind = "on_off"
pin_bcm = 25
active_state = "high"
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tmp config");
    f.write_all(contents.as_bytes()).expect("write config");
    f
}

#[test]
fn self_check_passes_on_sim_backends() {
    let cfg = write_config(VALID_CONFIG);
    Command::cargo_bin("beltsort")
        .expect("binary")
        .args(["--config", cfg.path().to_str().unwrap(), "self-check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn invalid_config_is_rejected_with_guidance() {
    let broken = VALID_CONFIG.replace("belt_speed_mps = 0.15", "belt_speed_mps = 0.0");
    let cfg = write_config(&broken);
    Command::cargo_bin("beltsort")
        .expect("binary")
        .args(["--config", cfg.path().to_str().unwrap(), "self-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("How to fix"));
}

#[test]
fn missing_config_file_reports_path() {
    Command::cargo_bin("beltsort")
        .expect("binary")
        .args(["--config", "/nonexistent/beltsort.toml", "self-check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("beltsort.toml"));
}

#[test]
fn short_sim_run_reports_summary() {
    let cfg = write_config(VALID_CONFIG);
    Command::cargo_bin("beltsort")
        .expect("binary")
        .args([
            "--config",
            cfg.path().to_str().unwrap(),
            "run",
            "--duration-s",
            "2",
            "--sim-trigger-interval-ms",
            "200",
        ])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("processed:"));
}
