use beltsort_config::load_toml;

fn base_toml() -> String {
    r#"
[camera]
index = 0
frame_width = 640
frame_height = 480

[model]
model_path = "models/sorter.onnx"
min_confidence = 0.5
fallback_category = "other"
max_inference_time_ms = 500

[model.class_mapping]
tin_can = "metal"
pet_bottle = "plastic"

[belt]
belt_speed_mps = 0.15
motor_pin_bcm = 26
min_duty_cycle = 20.0
max_duty_cycle = 100.0

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
"#
    .to_string()
}

#[test]
fn accepts_complete_config() {
    let cfg = load_toml(&base_toml()).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
}

#[test]
fn rejects_zero_belt_speed() {
    let toml = base_toml().replace("belt_speed_mps = 0.15", "belt_speed_mps = 0.0");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject belt_speed_mps=0");
    assert!(format!("{err}").contains("belt.belt_speed_mps"));
}

#[test]
fn rejects_belt_faster_than_timing_budget() {
    let toml = base_toml().replace("belt_speed_mps = 0.15", "belt_speed_mps = 0.9");
    let cfg = load_toml(&toml).expect("parse TOML");
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_unknown_category_in_distances() {
    let toml = base_toml().replace("metal = 0.60", "cardboard = 0.60");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("unknown category");
    assert!(format!("{err}").to_lowercase().contains("unknown category"));
}

#[test]
fn rejects_distance_without_diverter() {
    let toml = base_toml().replace("plastic = 0.80", "glass = 0.80");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("glass has no diverter entry");
    assert!(format!("{err}").contains("glass"));
}

#[test]
fn rejects_stepper_without_step_pin() {
    let toml = base_toml().replace("step_pin_bcm = 23\n", "");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("stepper needs pins");
    assert!(format!("{err}").contains("step_pin_bcm"));
}

#[test]
fn rejects_duplicate_pin_claims() {
    // Trigger input and the plastic diverter both claim BCM 17.
    let toml = base_toml().replace("pin_bcm = 25", "pin_bcm = 17");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("duplicate pin");
    assert!(format!("{err}").contains("already claimed"));
}

#[test]
fn rejects_confidence_out_of_range() {
    let toml = base_toml().replace("min_confidence = 0.5", "min_confidence = 1.5");
    let cfg = load_toml(&toml).expect("parse TOML");
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_unknown_fallback_category() {
    let toml = base_toml().replace(
        "fallback_category = \"other\"",
        "fallback_category = \"misc\"",
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("unknown fallback");
    assert!(format!("{err}").contains("fallback_category"));
}

#[test]
fn rejects_bad_class_mapping_target() {
    let toml = base_toml().replace("tin_can = \"metal\"", "tin_can = \"steel\"");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("unknown mapping target");
    assert!(format!("{err}").contains("class_mapping"));
}

#[test]
fn rejects_inverted_bin_distances() {
    let toml = base_toml().replace("empty_distance_m = 1.0", "empty_distance_m = 0.05");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("empty must exceed full");
    assert!(format!("{err}").contains("empty_distance_m"));
}
