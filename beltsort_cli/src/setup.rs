//! Maps the file-level configuration onto the core snapshot and builds the
//! machine from the selected backend (simulation by default, GPIO with the
//! `hardware` feature).

use std::str::FromStr;
use std::time::Duration;

use beltsort_config::Config;
use beltsort_core::{
    BeltCfg, BinCfg, CategoryRoute, ClassifyCfg, LimitsCfg, Orchestrator, RecoveryCfg,
    ScheduleCfg, Snapshot, TriggerEvent,
};
use beltsort_traits::Category;
use crossbeam_channel as xch;
use eyre::WrapErr;

/// Convert the validated file config into the core's typed snapshot.
pub fn snapshot_from_config(cfg: &Config) -> eyre::Result<Snapshot> {
    let mut snap = Snapshot::default();

    snap.routes.clear();
    for (name, dist) in &cfg.belt.distances_m {
        let category = Category::from_str(name).map_err(|e| eyre::eyre!(e))?;
        let div = cfg
            .diverters
            .get(name)
            .ok_or_else(|| eyre::eyre!("no diverter for category {name}"))?;
        let activation = div
            .activation_duration_s
            .unwrap_or(cfg.belt.diverter_activation_duration_s);
        snap.routes.insert(
            category,
            CategoryRoute {
                distance_m: *dist,
                activation: Duration::from_secs_f64(activation),
                lead: Duration::from_millis(div.activation_lead_ms),
                max_operations: div.max_operations,
            },
        );
    }

    snap.schedule = ScheduleCfg {
        simultaneous_activations: cfg.diverters_global.simultaneous_activations,
        min_gap: Duration::from_millis(cfg.diverters_global.timeout_between_activations_ms),
        grace: Duration::from_millis(cfg.scheduler.grace_ms),
        pause_grace: Duration::from_millis(cfg.scheduler.pause_grace_ms),
    };

    let fallback = Category::from_str(&cfg.model.fallback_category).map_err(|e| eyre::eyre!(e))?;
    let mut aliases = std::collections::HashMap::new();
    for (alias, canon) in &cfg.model.class_mapping {
        let category = Category::from_str(canon).map_err(|e| eyre::eyre!(e))?;
        aliases.insert(alias.clone(), category);
    }
    snap.classify = ClassifyCfg {
        min_confidence: cfg.model.min_confidence,
        fallback,
        aliases,
        budget: Duration::from_millis(cfg.model.max_inference_time_ms),
    };

    snap.belt = BeltCfg {
        nominal_mps: cfg.belt.belt_speed_mps,
        min_duty: cfg.belt.min_duty_cycle,
        max_duty: cfg.belt.max_duty_cycle,
        accel: Duration::from_secs_f64(cfg.belt.accel_time_s),
        decel: Duration::from_secs_f64(cfg.belt.decel_time_s),
    };

    snap.limits = LimitsCfg {
        cpu_warn_pct: cfg.monitoring.cpu_warn_pct,
        cpu_crit_pct: cfg.monitoring.cpu_crit_pct,
        mem_warn_pct: cfg.monitoring.mem_warn_pct,
        mem_crit_pct: cfg.monitoring.mem_crit_pct,
        temp_warn_c: cfg.monitoring.temp_warn_c,
        temp_crit_c: cfg.safety.max_temperature_celsius,
        max_runtime: Duration::from_secs_f64(cfg.safety.max_continuous_runtime_hours * 3600.0),
        max_items_per_hour: cfg.safety.max_objects_per_hour,
        error_rate_warn: cfg.monitoring.error_rate_warn,
        clear_margin: cfg.monitoring.clear_margin,
        clear_samples: cfg.monitoring.clear_samples,
    };

    snap.recovery = RecoveryCfg {
        enabled: cfg.system.error_recovery_enabled,
        max_consecutive: cfg.diverters_global.max_consecutive_failures,
        cooldown: Duration::from_secs_f64(cfg.diverters_global.failure_recovery_delay_s),
        global_budget: cfg.system.max_restart_attempts,
        budget_window: Duration::from_secs_f64(cfg.system.restart_delay_s * 2.0),
        auto_disable_on_fault: cfg.diverters_global.auto_disable_on_fault,
    };

    snap.bins = BinCfg {
        warn_pct: cfg.bins_common.warn_percent,
        full_pct: cfg.bins_common.full_percent,
        crit_pct: cfg.bins_common.critical_percent,
        smoothing_samples: cfg.bins_common.smoothing_samples,
        poll_interval: Duration::from_secs_f64(cfg.bins_common.update_interval_s),
        measure_timeout: Duration::from_secs_f64(cfg.bins_common.measurement_timeout_s),
    };

    snap.metrics_interval = Duration::from_secs_f64(cfg.monitoring.metrics_interval_s);
    snap.metrics_history = cfg.monitoring.metrics_history;
    snap.maintenance_timeout = Duration::from_secs_f64(cfg.scheduler.maintenance_timeout_s);
    snap.max_processing_errors = cfg.system.max_processing_errors;
    snap.shutdown_drain = Duration::from_secs_f64(cfg.scheduler.max_shutdown_drain_s);
    snap.estop_debounce_n = cfg.safety.estop_debounce_n;
    snap.trigger_debounce = Duration::from_millis(cfg.trigger.debounce_ms);
    snap.tick = Duration::from_millis(cfg.scheduler.tick_ms);

    Ok(snap)
}

/// A built machine plus whatever side handles the backend needs kept alive.
pub struct Machine {
    pub orchestrator: Orchestrator,
    /// Simulation backends only: push synthetic camera triggers here.
    pub sim_trigger_tx: Option<xch::Sender<TriggerEvent>>,
    #[cfg(feature = "hardware")]
    pub listener: beltsort_core::TriggerListener,
}

#[cfg(not(feature = "hardware"))]
pub fn build_machine(cfg: &Config) -> eyre::Result<Machine> {
    use beltsort_hardware::{ProcProbe, SimBeltDrive, SimCamera, SimClassifier, SimDiverter,
        SimLevelSensor};

    let snapshot = snapshot_from_config(cfg)?;
    let (trigger_tx, trigger_rx) = xch::bounded(64);

    // Capture and inference run out-of-process in production; the CLI wires
    // the simulated stand-ins.
    let mut builder = Orchestrator::builder()
        .with_snapshot(snapshot)
        .with_belt_drive(Box::new(SimBeltDrive::new()))
        .with_camera(Box::new(SimCamera::new()))
        .with_classifier(Box::new(SimClassifier::new(&cfg.model.fallback_category, 0.9)))
        .with_probe(Box::new(ProcProbe::new()))
        .with_trigger_source(trigger_rx);

    for name in cfg.belt.distances_m.keys() {
        let category = Category::from_str(name).map_err(|e| eyre::eyre!(e))?;
        builder = builder.with_diverter(category, Box::new(SimDiverter::new()));
    }
    for (name, bin) in &cfg.bins {
        let category = Category::from_str(name).map_err(|e| eyre::eyre!(e))?;
        builder = builder.with_bin(
            category,
            Box::new(SimLevelSensor::new(bin.empty_distance_m as f32)),
            bin.empty_distance_m as f32,
            bin.full_distance_m as f32,
        );
    }

    let orchestrator = builder.build().wrap_err("building orchestrator")?;
    Ok(Machine {
        orchestrator,
        sim_trigger_tx: Some(trigger_tx),
    })
}

#[cfg(feature = "hardware")]
pub fn build_machine(cfg: &Config) -> eyre::Result<Machine> {
    use beltsort_core::TriggerListener;
    use beltsort_hardware::{
        GpioEdgeInput, OnOffDiverter, ProcProbe, PwmBeltDrive, SimCamera, SimClassifier,
        StepperDiverter, StepperTiming, UltrasonicLevelSensor, make_estop_checker,
    };

    let snapshot = snapshot_from_config(cfg)?;

    let belt = PwmBeltDrive::try_new(cfg.belt.motor_pin_bcm, cfg.belt.pwm_frequency_hz)
        .wrap_err("open belt PWM pin")?;

    let edge = GpioEdgeInput::try_new(cfg.trigger.pin_bcm, cfg.trigger.trigger_mode == "rising")
        .wrap_err("open trigger pin")?;
    let listener = TriggerListener::spawn(edge, Duration::from_millis(cfg.trigger.debounce_ms));

    let mut builder = Orchestrator::builder()
        .with_snapshot(snapshot)
        .with_belt_drive(Box::new(belt))
        .with_camera(Box::new(SimCamera::new()))
        .with_classifier(Box::new(SimClassifier::new(&cfg.model.fallback_category, 0.9)))
        .with_probe(Box::new(ProcProbe::new()))
        .with_trigger_source(listener.events());

    if cfg.safety.emergency_stop_enabled
        && let Some(pin) = cfg.belt.emergency_stop_pin_bcm
    {
        let check = make_estop_checker(pin, true, 10).wrap_err("open E-stop pin")?;
        builder = builder.with_estop_check(check);
    }

    for (name, div) in &cfg.diverters {
        let category = Category::from_str(name).map_err(|e| eyre::eyre!(e))?;
        let actuator: Box<dyn beltsort_traits::Actuator + Send> = match div.kind.as_str() {
            "stepper" => Box::new(
                StepperDiverter::try_new(
                    div.step_pin_bcm.unwrap_or_default(),
                    div.dir_pin_bcm.unwrap_or_default(),
                    div.enable_pin_bcm,
                    div.steps_per_activation,
                    div.activation_direction_cw,
                    div.return_to_home,
                    StepperTiming {
                        start_delay: Duration::from_micros(div.ramping_start_delay_us),
                        min_delay: Duration::from_micros(div.ramping_min_delay_us),
                        accel_steps: div.ramping_accel_steps,
                        use_ramping: div.use_ramping,
                    },
                )
                .wrap_err_with(|| format!("open stepper pins for {name}"))?,
            ),
            _ => Box::new(
                OnOffDiverter::try_new(
                    div.pin_bcm.unwrap_or_default(),
                    div.active_state == "high",
                )
                .wrap_err_with(|| format!("open diverter pin for {name}"))?,
            ),
        };
        builder = builder.with_diverter(category, actuator);
    }

    for (name, bin) in &cfg.bins {
        let category = Category::from_str(name).map_err(|e| eyre::eyre!(e))?;
        let sensor = UltrasonicLevelSensor::try_new(bin.trigger_pin_bcm, bin.echo_pin_bcm)
            .wrap_err_with(|| format!("open bin sensor pins for {name}"))?;
        builder = builder.with_bin(
            category,
            Box::new(sensor),
            bin.empty_distance_m as f32,
            bin.full_distance_m as f32,
        );
    }

    let orchestrator = builder.build().wrap_err("building orchestrator")?;
    Ok(Machine {
        orchestrator,
        sim_trigger_tx: None,
        listener,
    })
}

/// Probe every configured device once: a capture, a blank-frame inference, a
/// zero-duty belt command, and a distance read per bin sensor.
#[cfg(not(feature = "hardware"))]
pub fn self_check(cfg: &Config) -> eyre::Result<()> {
    use beltsort_hardware::{SimBeltDrive, SimCamera, SimClassifier, SimLevelSensor};
    use beltsort_traits::{BeltDrive, Classifier, FrameSource, LevelSensor};

    let budget = Duration::from_millis(cfg.model.max_inference_time_ms);

    let mut camera = SimCamera::new();
    let frame = camera
        .capture(budget)
        .map_err(|e| eyre::eyre!("camera capture failed: {e}"))?;
    tracing::info!(seq = frame.seq, "camera capture ok");

    let mut classifier = SimClassifier::new(&cfg.model.fallback_category, 0.9);
    classifier
        .classify(&frame, budget)
        .map_err(|e| eyre::eyre!("classifier probe failed: {e}"))?;
    tracing::info!("classifier ok");

    let mut belt = SimBeltDrive::new();
    belt.set_duty(0.0)
        .and_then(|_| belt.power_off())
        .map_err(|e| eyre::eyre!("belt drive probe failed: {e}"))?;
    tracing::info!("belt drive ok");

    let timeout = Duration::from_secs_f64(cfg.bins_common.measurement_timeout_s);
    for (name, bin) in &cfg.bins {
        let mut sensor = SimLevelSensor::new(bin.empty_distance_m as f32);
        let d = sensor
            .measure(timeout)
            .map_err(|e| eyre::eyre!("bin sensor {name} failed: {e}"))?;
        tracing::info!(bin = %name, distance_m = d, "bin sensor ok");
    }
    Ok(())
}

#[cfg(feature = "hardware")]
pub fn self_check(cfg: &Config) -> eyre::Result<()> {
    use beltsort_hardware::{
        OnOffDiverter, PwmBeltDrive, SimCamera, SimClassifier, StepperDiverter, StepperTiming,
        UltrasonicLevelSensor,
    };
    use beltsort_traits::{Actuator, BeltDrive, Classifier, FrameSource, LevelSensor};

    let budget = Duration::from_millis(cfg.model.max_inference_time_ms);

    let mut camera = SimCamera::new();
    let frame = camera
        .capture(budget)
        .map_err(|e| eyre::eyre!("camera capture failed: {e}"))?;
    let mut classifier = SimClassifier::new(&cfg.model.fallback_category, 0.9);
    classifier
        .classify(&frame, budget)
        .map_err(|e| eyre::eyre!("classifier probe failed: {e}"))?;
    tracing::info!("capture/inference stand-ins ok");

    let mut belt = PwmBeltDrive::try_new(cfg.belt.motor_pin_bcm, cfg.belt.pwm_frequency_hz)
        .wrap_err("open belt PWM pin")?;
    belt.set_duty(0.0)
        .and_then(|_| belt.power_off())
        .map_err(|e| eyre::eyre!("belt drive probe failed: {e}"))?;
    tracing::info!("belt drive ok");

    for (name, div) in &cfg.diverters {
        let mut actuator: Box<dyn Actuator + Send> = match div.kind.as_str() {
            "stepper" => Box::new(StepperDiverter::try_new(
                div.step_pin_bcm.unwrap_or_default(),
                div.dir_pin_bcm.unwrap_or_default(),
                div.enable_pin_bcm,
                div.steps_per_activation,
                div.activation_direction_cw,
                div.return_to_home,
                StepperTiming {
                    start_delay: Duration::from_micros(div.ramping_start_delay_us),
                    min_delay: Duration::from_micros(div.ramping_min_delay_us),
                    accel_steps: div.ramping_accel_steps,
                    use_ramping: div.use_ramping,
                },
            )
            .wrap_err_with(|| format!("open stepper pins for {name}"))?),
            _ => Box::new(
                OnOffDiverter::try_new(div.pin_bcm.unwrap_or_default(), div.active_state == "high")
                    .wrap_err_with(|| format!("open diverter pin for {name}"))?,
            ),
        };
        actuator
            .initialize()
            .map_err(|e| eyre::eyre!("diverter {name} init failed: {e}"))?;
        tracing::info!(diverter = %name, "diverter ok");
    }

    let timeout = Duration::from_secs_f64(cfg.bins_common.measurement_timeout_s);
    for (name, bin) in &cfg.bins {
        let mut sensor = UltrasonicLevelSensor::try_new(bin.trigger_pin_bcm, bin.echo_pin_bcm)
            .wrap_err_with(|| format!("open bin sensor pins for {name}"))?;
        let d = sensor
            .measure(timeout)
            .map_err(|e| eyre::eyre!("bin sensor {name} read failed: {e}"))?;
        tracing::info!(bin = %name, distance_m = d, "bin sensor ok");
    }
    Ok(())
}
