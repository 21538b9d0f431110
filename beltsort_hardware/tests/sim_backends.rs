#![cfg(not(feature = "hardware"))]

use std::time::Duration;

use beltsort_hardware::{SimClassifier, SimDiverter, SimLevelSensor};
use beltsort_traits::{Actuator, Classifier, Frame, LevelSensor};
use rstest::rstest;

#[rstest]
fn sim_diverter_records_activations_and_injected_faults() {
    let div = SimDiverter::new();
    let mut handle = div.clone();

    handle.activate(Duration::from_millis(10)).expect("first");
    div.fail_next(1);
    let err = handle
        .activate(Duration::from_millis(10))
        .expect_err("injected fault");
    assert!(format!("{err}").contains("fault"));
    handle.activate(Duration::from_millis(10)).expect("third");

    assert_eq!(div.activation_count(), 2);
}

#[rstest]
fn sim_classifier_plays_script_then_falls_back() {
    let cls = SimClassifier::new("other", 0.3);
    cls.push_detection("metal", 0.92);
    cls.push_result(Err("model crashed".into()));

    let mut handle = cls.clone();
    let frame = Frame::default();
    let budget = Duration::from_millis(100);

    let first = handle.classify(&frame, budget).expect("scripted detection");
    assert_eq!(first[0].label, "metal");

    assert!(handle.classify(&frame, budget).is_err());

    let fallback = handle.classify(&frame, budget).expect("default");
    assert_eq!(fallback[0].label, "other");
    assert!((fallback[0].confidence - 0.3).abs() < f32::EPSILON);
}

#[rstest]
#[case(0.50, 0.50)]
#[case(0.05, 0.05)]
fn sim_level_sensor_reports_set_distance(#[case] set: f32, #[case] expect: f32) {
    let sensor = SimLevelSensor::new(set);
    let mut handle = sensor.clone();
    let d = handle.measure(Duration::from_millis(10)).expect("measure");
    assert!((d - expect).abs() < 1e-6);

    sensor.set_error("echo timeout");
    assert!(handle.measure(Duration::from_millis(10)).is_err());
}
