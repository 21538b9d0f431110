//! Typed configuration for the beltsort control plane.
//!
//! The TOML file is parsed into an owned [`Config`]; `validate()` rejects the
//! first offending field with a message naming it. Consumers receive the
//! snapshot behind an `Arc` and never mutate it; hot reload replaces the
//! whole snapshot atomically.

use std::collections::{HashMap, HashSet};

use beltsort_traits::Category;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

fn reject(field: &str, why: &str) -> ConfigError {
    ConfigError(format!("{field}: {why}"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemCfg {
    pub error_recovery_enabled: bool,
    pub max_processing_errors: u32,
    pub auto_restart_on_error: bool,
    pub max_restart_attempts: u32,
    pub restart_delay_s: f64,
    pub data_retention_days: u32,
}

impl Default for SystemCfg {
    fn default() -> Self {
        Self {
            error_recovery_enabled: true,
            max_processing_errors: 10,
            auto_restart_on_error: true,
            max_restart_attempts: 5,
            restart_delay_s: 30.0,
            data_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraCfg {
    #[serde(default)]
    pub index: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_warmup")]
    pub warmup_frames: u32,
    #[serde(default)]
    pub backup_indices: Vec<u32>,
    #[serde(default = "default_true")]
    pub auto_recovery: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCfg {
    pub model_path: String,
    #[serde(default)]
    pub backup_model_path: Option<String>,
    pub min_confidence: f32,
    #[serde(default = "default_fallback")]
    pub fallback_category: String,
    /// Model alias -> canonical category name.
    #[serde(default)]
    pub class_mapping: HashMap<String, String>,
    #[serde(default = "default_inference_ms")]
    pub max_inference_time_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeltCfg {
    pub belt_speed_mps: f64,
    /// Category name -> camera-to-diverter distance in meters.
    pub distances_m: HashMap<String, f64>,
    #[serde(default = "default_activation_s")]
    pub diverter_activation_duration_s: f64,
    pub motor_pin_bcm: u8,
    #[serde(default = "default_pwm_hz")]
    pub pwm_frequency_hz: f64,
    #[serde(default)]
    pub min_duty_cycle: f32,
    #[serde(default = "default_max_duty")]
    pub max_duty_cycle: f32,
    #[serde(default = "default_ramp_s")]
    pub accel_time_s: f64,
    #[serde(default = "default_ramp_s")]
    pub decel_time_s: f64,
    #[serde(default)]
    pub emergency_stop_pin_bcm: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerCfg {
    pub pin_bcm: u8,
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinSensorCfg {
    pub trigger_pin_bcm: u8,
    pub echo_pin_bcm: u8,
    pub empty_distance_m: f64,
    pub full_distance_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinCommonCfg {
    pub warn_percent: f32,
    pub full_percent: f32,
    pub critical_percent: f32,
    pub smoothing_samples: usize,
    pub update_interval_s: f64,
    pub measurement_timeout_s: f64,
}

impl Default for BinCommonCfg {
    fn default() -> Self {
        Self {
            warn_percent: 70.0,
            full_percent: 85.0,
            critical_percent: 95.0,
            smoothing_samples: 5,
            update_interval_s: 5.0,
            measurement_timeout_s: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiverterCfg {
    /// "stepper" or "on_off".
    pub kind: String,
    #[serde(default)]
    pub step_pin_bcm: Option<u8>,
    #[serde(default)]
    pub dir_pin_bcm: Option<u8>,
    #[serde(default)]
    pub enable_pin_bcm: Option<u8>,
    #[serde(default)]
    pub pin_bcm: Option<u8>,
    #[serde(default = "default_active_high")]
    pub active_state: String,
    #[serde(default = "default_steps")]
    pub steps_per_activation: u32,
    /// true = clockwise out.
    #[serde(default = "default_true")]
    pub activation_direction_cw: bool,
    #[serde(default = "default_true")]
    pub return_to_home: bool,
    #[serde(default)]
    pub use_ramping: bool,
    #[serde(default = "default_ramp_start_us")]
    pub ramping_start_delay_us: u64,
    #[serde(default = "default_ramp_min_us")]
    pub ramping_min_delay_us: u64,
    #[serde(default = "default_ramp_steps")]
    pub ramping_accel_steps: u32,
    #[serde(default)]
    pub activation_duration_s: Option<f64>,
    #[serde(default)]
    pub activation_lead_ms: u64,
    #[serde(default)]
    pub max_operations: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiverterGlobalCfg {
    pub simultaneous_activations: bool,
    pub timeout_between_activations_ms: u64,
    pub max_consecutive_failures: u32,
    pub failure_recovery_delay_s: f64,
    pub auto_disable_on_fault: bool,
}

impl Default for DiverterGlobalCfg {
    fn default() -> Self {
        Self {
            simultaneous_activations: false,
            timeout_between_activations_ms: 200,
            max_consecutive_failures: 3,
            failure_recovery_delay_s: 30.0,
            auto_disable_on_fault: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyCfg {
    pub emergency_stop_enabled: bool,
    pub estop_debounce_n: u8,
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: u32,
    pub max_continuous_runtime_hours: f64,
    pub max_objects_per_hour: u32,
    pub max_temperature_celsius: f32,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            emergency_stop_enabled: true,
            estop_debounce_n: 2,
            max_failed_attempts: 5,
            lockout_duration_minutes: 30,
            max_continuous_runtime_hours: 12.0,
            max_objects_per_hour: 3600,
            max_temperature_celsius: 75.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringCfg {
    pub metrics_interval_s: f64,
    pub metrics_history: usize,
    pub cpu_warn_pct: f32,
    pub cpu_crit_pct: f32,
    pub mem_warn_pct: f32,
    pub mem_crit_pct: f32,
    pub temp_warn_c: f32,
    pub temp_crit_c: f32,
    pub error_rate_warn: f32,
    /// Hysteresis: a breach clears only after the value stays below
    /// threshold - clear_margin for clear_samples consecutive samples.
    pub clear_margin: f32,
    pub clear_samples: u32,
}

impl Default for MonitoringCfg {
    fn default() -> Self {
        Self {
            metrics_interval_s: 5.0,
            metrics_history: 720,
            cpu_warn_pct: 80.0,
            cpu_crit_pct: 95.0,
            mem_warn_pct: 85.0,
            mem_crit_pct: 95.0,
            temp_warn_c: 70.0,
            temp_crit_c: 80.0,
            error_rate_warn: 0.25,
            clear_margin: 5.0,
            clear_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerCfg {
    /// Jitter tolerance around scheduled fire times, ms.
    pub grace_ms: u64,
    /// Fires later than now + pause_grace are cancelled on pause.
    pub pause_grace_ms: u64,
    /// Orchestrator tick period, ms.
    pub tick_ms: u64,
    pub maintenance_timeout_s: f64,
    pub max_shutdown_drain_s: f64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            grace_ms: 50,
            pause_grace_ms: 100,
            tick_ms: 10,
            maintenance_timeout_s: 1800.0,
            max_shutdown_drain_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingCfg {
    /// Path to a log file (JSON lines); console-only when unset.
    pub file: Option<String>,
    pub level: Option<String>,
    /// "never" | "daily" | "hourly"
    pub rotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemCfg,
    pub camera: CameraCfg,
    pub model: ModelCfg,
    pub belt: BeltCfg,
    pub trigger: TriggerCfg,
    /// Category name -> bin sensor wiring.
    #[serde(default)]
    pub bins: HashMap<String, BinSensorCfg>,
    #[serde(default)]
    pub bins_common: BinCommonCfg,
    /// Category name -> diverter wiring.
    pub diverters: HashMap<String, DiverterCfg>,
    #[serde(default)]
    pub diverters_global: DiverterGlobalCfg,
    #[serde(default)]
    pub safety: SafetyCfg,
    #[serde(default)]
    pub monitoring: MonitoringCfg,
    #[serde(default)]
    pub scheduler: SchedulerCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    /// Validate field ranges and cross-section consistency. Returns the first
    /// rejected field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.belt.belt_speed_mps <= 0.0 {
            return Err(reject("belt.belt_speed_mps", "must be > 0"));
        }
        if self.belt.belt_speed_mps > 0.5 {
            return Err(reject(
                "belt.belt_speed_mps",
                "must be <= 0.5 (timing budget assumes slow belts)",
            ));
        }
        if !(0.0..=1.0).contains(&self.model.min_confidence) {
            return Err(reject("model.min_confidence", "must be in 0..=1"));
        }
        if self.model.model_path.is_empty() {
            return Err(reject("model.model_path", "must not be empty"));
        }
        if self.model.max_inference_time_ms == 0 {
            return Err(reject("model.max_inference_time_ms", "must be > 0"));
        }
        self.model
            .fallback_category
            .parse::<Category>()
            .map_err(|e| reject("model.fallback_category", &e))?;
        for (alias, canon) in &self.model.class_mapping {
            canon.parse::<Category>().map_err(|_| {
                reject(
                    "model.class_mapping",
                    &format!("alias {alias:?} maps to unknown category {canon:?}"),
                )
            })?;
        }

        if self.camera.frame_width == 0 || self.camera.frame_height == 0 {
            return Err(reject("camera.frame_width/frame_height", "must be > 0"));
        }

        if self.belt.min_duty_cycle < 0.0 || self.belt.max_duty_cycle > 100.0 {
            return Err(reject(
                "belt.min_duty_cycle/max_duty_cycle",
                "must be within 0..=100",
            ));
        }
        if self.belt.min_duty_cycle >= self.belt.max_duty_cycle {
            return Err(reject("belt.min_duty_cycle", "must be < max_duty_cycle"));
        }

        for (name, dist) in &self.belt.distances_m {
            name.parse::<Category>()
                .map_err(|e| reject("belt.distances_m", &e))?;
            if *dist <= 0.0 {
                return Err(reject(
                    "belt.distances_m",
                    &format!("{name}: distance must be > 0"),
                ));
            }
        }
        if self.belt.diverter_activation_duration_s <= 0.0 {
            return Err(reject("belt.diverter_activation_duration_s", "must be > 0"));
        }

        for (name, div) in &self.diverters {
            name.parse::<Category>()
                .map_err(|e| reject("diverters", &e))?;
            match div.kind.as_str() {
                "stepper" => {
                    if div.step_pin_bcm.is_none() || div.dir_pin_bcm.is_none() {
                        return Err(reject(
                            "diverters",
                            &format!("{name}: stepper requires step_pin_bcm and dir_pin_bcm"),
                        ));
                    }
                    if div.steps_per_activation == 0 {
                        return Err(reject(
                            "diverters",
                            &format!("{name}: steps_per_activation must be > 0"),
                        ));
                    }
                    if div.use_ramping && div.ramping_min_delay_us > div.ramping_start_delay_us {
                        return Err(reject(
                            "diverters",
                            &format!("{name}: ramping_min_delay_us must be <= ramping_start_delay_us"),
                        ));
                    }
                }
                "on_off" => {
                    if div.pin_bcm.is_none() {
                        return Err(reject(
                            "diverters",
                            &format!("{name}: on_off requires pin_bcm"),
                        ));
                    }
                    if !matches!(div.active_state.as_str(), "high" | "low") {
                        return Err(reject(
                            "diverters",
                            &format!("{name}: active_state must be \"high\" or \"low\""),
                        ));
                    }
                }
                other => {
                    return Err(reject(
                        "diverters",
                        &format!("{name}: unknown kind {other:?}"),
                    ));
                }
            }
            if let Some(d) = div.activation_duration_s
                && d <= 0.0
            {
                return Err(reject(
                    "diverters",
                    &format!("{name}: activation_duration_s must be > 0"),
                ));
            }
        }
        // Every routed category needs an actuator behind it.
        for name in self.belt.distances_m.keys() {
            if !self.diverters.contains_key(name) {
                return Err(reject(
                    "belt.distances_m",
                    &format!("{name}: has a distance but no [diverters.{name}] entry"),
                ));
            }
        }

        for (name, bin) in &self.bins {
            name.parse::<Category>().map_err(|e| reject("bins", &e))?;
            if bin.empty_distance_m <= bin.full_distance_m {
                return Err(reject(
                    "bins",
                    &format!("{name}: empty_distance_m must be > full_distance_m"),
                ));
            }
        }
        let bc = &self.bins_common;
        if !(bc.warn_percent < bc.full_percent && bc.full_percent <= bc.critical_percent) {
            return Err(reject(
                "bins_common",
                "thresholds must satisfy warn < full <= critical",
            ));
        }
        if bc.smoothing_samples == 0 {
            return Err(reject("bins_common.smoothing_samples", "must be > 0"));
        }

        let mon = &self.monitoring;
        if mon.metrics_interval_s <= 0.0 {
            return Err(reject("monitoring.metrics_interval_s", "must be > 0"));
        }
        if mon.cpu_warn_pct >= mon.cpu_crit_pct
            || mon.mem_warn_pct >= mon.mem_crit_pct
            || mon.temp_warn_c >= mon.temp_crit_c
        {
            return Err(reject(
                "monitoring",
                "warn thresholds must be below critical thresholds",
            ));
        }

        if self.scheduler.tick_ms == 0 {
            return Err(reject("scheduler.tick_ms", "must be > 0"));
        }
        if !matches!(self.trigger.trigger_mode.as_str(), "rising" | "falling") {
            return Err(reject(
                "trigger.trigger_mode",
                "must be \"rising\" or \"falling\"",
            ));
        }

        self.check_pin_claims()
    }

    /// Every GPIO pin is owned by exactly one component; duplicate claims are
    /// a startup error, including the optional backup pins.
    fn check_pin_claims(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<u8> = HashSet::new();
        let mut claim = |field: String, pin: u8| -> Result<(), ConfigError> {
            if !seen.insert(pin) {
                return Err(ConfigError(format!(
                    "{field}: BCM pin {pin} is already claimed by another component"
                )));
            }
            Ok(())
        };

        claim("belt.motor_pin_bcm".into(), self.belt.motor_pin_bcm)?;
        if let Some(p) = self.belt.emergency_stop_pin_bcm {
            claim("belt.emergency_stop_pin_bcm".into(), p)?;
        }
        claim("trigger.pin_bcm".into(), self.trigger.pin_bcm)?;
        for (name, bin) in &self.bins {
            claim(format!("bins.{name}.trigger_pin_bcm"), bin.trigger_pin_bcm)?;
            claim(format!("bins.{name}.echo_pin_bcm"), bin.echo_pin_bcm)?;
        }
        for (name, div) in &self.diverters {
            for (field, pin) in [
                ("step_pin_bcm", div.step_pin_bcm),
                ("dir_pin_bcm", div.dir_pin_bcm),
                ("enable_pin_bcm", div.enable_pin_bcm),
                ("pin_bcm", div.pin_bcm),
            ] {
                if let Some(p) = pin {
                    claim(format!("diverters.{name}.{field}"), p)?;
                }
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_fps() -> u32 {
    30
}
fn default_warmup() -> u32 {
    5
}
fn default_fallback() -> String {
    "other".into()
}
fn default_inference_ms() -> u64 {
    500
}
fn default_activation_s() -> f64 {
    0.75
}
fn default_pwm_hz() -> f64 {
    1000.0
}
fn default_max_duty() -> f32 {
    100.0
}
fn default_ramp_s() -> f64 {
    1.0
}
fn default_trigger_mode() -> String {
    "rising".into()
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_active_high() -> String {
    "high".into()
}
fn default_steps() -> u32 {
    200
}
fn default_ramp_start_us() -> u64 {
    5000
}
fn default_ramp_min_us() -> u64 {
    1000
}
fn default_ramp_steps() -> u32 {
    50
}
