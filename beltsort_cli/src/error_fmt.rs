//! Operator-facing error formatting: what happened, likely causes, the fix.

use beltsort_core::{BuildError, SorterError};

pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingBelt => {
                "What happened: No belt drive was provided to the orchestrator.\nLikely causes: PWM pin failed to open or the builder was not wired.\nHow to fix: Check belt.motor_pin_bcm in the config and GPIO permissions.".to_string()
            }
            BuildError::MissingCamera => {
                "What happened: No camera was provided to the orchestrator.\nLikely causes: Camera index wrong or device busy.\nHow to fix: Check camera.index (and backup_indices) in the config.".to_string()
            }
            BuildError::MissingClassifier => {
                "What happened: No classifier backend was provided.\nLikely causes: Model file missing or failed to load.\nHow to fix: Check model.model_path; try the backup model.".to_string()
            }
            BuildError::NoDiverters => {
                "What happened: No diverters are configured.\nLikely causes: Empty [diverters] section.\nHow to fix: Add at least one [diverters.<category>] entry.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(se) = err.downcast_ref::<SorterError>() {
        if let SorterError::Timeout(what) = se {
            return format!(
                "What happened: Timed out waiting for {what}.\nLikely causes: Wiring, power, or a timeout configured too low.\nHow to fix: Verify the wiring and raise the relevant timeout in the config."
            );
        }
        if let SorterError::State(s) = se {
            let lower = s.to_ascii_lowercase();
            if lower.contains("e-stop") || lower.contains("estop") {
                return "What happened: The emergency stop is asserted.\nLikely causes: E-stop button pressed or input pin active.\nHow to fix: Release the E-stop, acknowledge, then start again.".to_string();
            }
            if lower.contains("temperature") {
                return "What happened: The host is over its temperature limit.\nLikely causes: Poor ventilation or sustained load.\nHow to fix: Let the machine cool down; check monitoring.temp_crit_c.".to_string();
            }
        }
        return format!(
            "What happened: {se}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
        );
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("invalid config") {
        return format!(
            "What happened: Configuration was rejected ({msg}).\nHow to fix: Correct the named field in the TOML and rerun."
        );
    }

    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}
