//! The orchestrator wires every component, runs the trigger -> classify ->
//! dispatch pipeline, and owns the configuration snapshot.
//!
//! All work happens inside `tick`, which the runner thread (or a test
//! with a virtual clock) drives. Each tick drains safety demands first, then
//! control flow, then pipeline work, so a forced transition is never
//! reordered behind an actuation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beltsort_traits::{Actuator, BeltDrive, Category, Classifier, Clock, FrameSource, LevelSensor,
    SystemProbe};
use crossbeam_channel as xch;
use eyre::WrapErr;

use crate::belt::{BeltController, BeltState};
use crate::bins::{BinMonitor, BinState};
use crate::bus::{Event, OverflowPolicy, Subscription, TelemetryBus, Topic};
use crate::classify::ClassifierClient;
use crate::config::Snapshot;
use crate::diverter::{DiverterPool, DiverterStatus};
use crate::error::{BuildError, DropReason, Result, SorterError};
use crate::fault::{Fault, FaultKind, Severity};
use crate::sensors::TriggerEvent;
use crate::metrics::{Counters, MetricsRing, MetricsSnapshot};
use crate::recovery::{FaultSummary, RecoveryAction, RecoverySupervisor};
use crate::safety::{EstopMonitor, HostReadings, LimitEvent, LimitKind, LimitLevel, LimitsWatchdog};
use crate::scheduler::{ClassifiedItem, DispatchScheduler, Due, PendingFire, ScheduleOutcome};
use crate::state::{StateMachine, SystemState};

/// Full status view returned by `status()`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: SystemState,
    pub state_reason: String,
    pub uptime: Duration,
    pub items_processed: u64,
    pub items_actuated: u64,
    pub items_dropped: u64,
    pub avg_processing_ms: f64,
    pub avg_confidence: f32,
    pub error_rate: f32,
    pub belt_state: BeltState,
    pub belt_speed_mps: f64,
    pub pending_fires: usize,
    pub diverters: HashMap<Category, DiverterStatus>,
    pub bins: HashMap<Category, (f32, BinState)>,
    pub host: HostReadings,
    pub faults: Vec<FaultSummary>,
}

pub struct Orchestrator {
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    snapshot: Arc<Snapshot>,
    pending_snapshot: Option<Arc<Snapshot>>,

    state: StateMachine,
    bus: TelemetryBus,
    scheduler: DispatchScheduler,
    pool: DiverterPool,
    belt: BeltController,
    bins: BinMonitor,
    classifier: ClassifierClient,
    backup_classifier: Option<Box<dyn Classifier + Send>>,
    camera: Box<dyn FrameSource + Send>,
    backup_cameras: VecDeque<Box<dyn FrameSource + Send>>,
    estop: EstopMonitor,
    limits: LimitsWatchdog,
    recovery: RecoverySupervisor,

    counters: Counters,
    ring: MetricsRing,
    trigger_rx: xch::Receiver<TriggerEvent>,

    next_item_id: u64,
    consecutive_errors: u32,
    run_started_at: Option<Instant>,
    started_wall: Instant,
    last_metrics_at: Option<Instant>,
    paused_by_limit: Option<LimitKind>,
    pre_fault_state: SystemState,
    shutdown_deadline: Option<Instant>,
    error_rate_high: bool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    // ── Control surface ──────────────────────────────────────────────────

    pub fn state(&self) -> SystemState {
        self.state.current()
    }

    pub fn bus(&self) -> &TelemetryBus {
        &self.bus
    }

    pub fn subscribe(
        &self,
        name: &'static str,
        topics: Option<Vec<Topic>>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Subscription {
        self.bus.subscribe(name, topics, capacity, policy)
    }

    /// idle -> running. Fails while unhealthy or with the E-stop latched.
    pub fn start(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        if self.estop.latched() || self.estop.asserted() {
            return Err(eyre::Report::new(SorterError::State(
                "cannot start with E-stop asserted".into(),
            )));
        }
        if self.state.current() != SystemState::Idle {
            return Err(eyre::Report::new(SorterError::State(format!(
                "cannot start from {}",
                self.state.current()
            ))));
        }
        self.belt
            .start(self.snapshot.belt.nominal_mps, now)
            .wrap_err("starting belt")?;
        let change = self.state.transition(SystemState::Running, "operator start", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        self.run_started_at = Some(now);
        Ok(self.state.current())
    }

    /// running -> paused. Imminent fires (inside the pause grace) complete.
    pub fn pause(&mut self, reason: &str) -> Result<SystemState> {
        let now = self.clock.now();
        if self.state.current() != SystemState::Running {
            return Err(eyre::Report::new(SorterError::State(format!(
                "cannot pause from {}",
                self.state.current()
            ))));
        }
        let change = self.state.transition(SystemState::Paused, reason, now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        self.belt.pause(now)?;
        let cancelled = self
            .scheduler
            .cancel_after(now + self.snapshot.schedule.pause_grace);
        self.drop_cancelled(cancelled, DropReason::BeltNotReady);
        Ok(self.state.current())
    }

    /// paused -> running.
    pub fn resume(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        if self.state.current() != SystemState::Paused {
            return Err(eyre::Report::new(SorterError::State(format!(
                "cannot resume from {}",
                self.state.current()
            ))));
        }
        if self.estop.latched() {
            return Err(eyre::Report::new(SorterError::State(
                "cannot resume with E-stop latched".into(),
            )));
        }
        self.belt.resume(now)?;
        let change = self.state.transition(SystemState::Running, "operator resume", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        self.paused_by_limit = None;
        Ok(self.state.current())
    }

    /// any -> error with reason E_STOP. Also invoked by the safety loop when
    /// the hardware input latches.
    pub fn emergency_stop(&mut self) -> SystemState {
        self.handle_estop("operator emergency stop");
        self.state.current()
    }

    /// idle|paused -> maintenance (auto-times-out back to idle).
    pub fn enter_maintenance(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        if !matches!(self.state.current(), SystemState::Idle | SystemState::Paused) {
            return Err(eyre::Report::new(SorterError::State(format!(
                "maintenance is entered from idle or paused, not {}",
                self.state.current()
            ))));
        }
        let change = self
            .state
            .transition(SystemState::Maintenance, "operator maintenance", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        Ok(self.state.current())
    }

    /// maintenance -> idle.
    pub fn exit_maintenance(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        let change = self
            .state
            .transition(SystemState::Idle, "maintenance complete", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        Ok(self.state.current())
    }

    /// Operator acknowledgement after an escalation: error -> recovering ->
    /// idle. Requires the E-stop input to be physically released.
    pub fn acknowledge(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        if self.state.current() != SystemState::Error {
            return Err(eyre::Report::new(SorterError::State(format!(
                "nothing to acknowledge in {}",
                self.state.current()
            ))));
        }
        if !self.estop.clear() {
            return Err(eyre::Report::new(SorterError::State(
                "E-stop still asserted".into(),
            )));
        }
        let change = self
            .state
            .transition(SystemState::Recovering, "operator acknowledge", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        self.belt.reset_emergency();
        self.pool.enable_all();
        self.recovery.reset();
        self.consecutive_errors = 0;
        let change = self.state.transition(SystemState::Idle, "reset complete", now)?;
        self.publish_state_change(&change.from, &change.to, &change.reason);
        Ok(self.state.current())
    }

    /// any -> shutting_down. The pipeline drains within the configured
    /// deadline; `tick` finishes the walk to `shutdown`.
    pub fn stop(&mut self) -> Result<SystemState> {
        let now = self.clock.now();
        if matches!(
            self.state.current(),
            SystemState::ShuttingDown | SystemState::Shutdown
        ) {
            return Ok(self.state.current());
        }
        // The graph reaches shutting_down from every live state, but walk
        // through the forced path so safety precedence still holds.
        self.state.force(SystemState::ShuttingDown, "operator stop");
        for change in self.state.drain_forced(now) {
            self.publish_state_change(&change.from, &change.to, &change.reason);
        }
        self.belt.stop(true, now)?;
        self.shutdown_deadline = Some(now + self.snapshot.shutdown_drain);
        Ok(self.state.current())
    }

    /// Atomically replace the configuration snapshot between iterations.
    /// Reloading an identical snapshot is observably a no-op.
    pub fn reload(&mut self, snapshot: Arc<Snapshot>) {
        self.pending_snapshot = Some(snapshot);
    }

    pub fn status(&self) -> StatusReport {
        let now = self.clock.now();
        StatusReport {
            state: self.state.current(),
            state_reason: self.state.last_reason().to_string(),
            uptime: now.saturating_duration_since(self.started_wall),
            items_processed: self.counters.items_processed,
            items_actuated: self.counters.items_actuated,
            items_dropped: self.counters.items_dropped,
            avg_processing_ms: self.counters.avg_processing_ms(),
            avg_confidence: self.counters.avg_confidence(),
            error_rate: self.counters.error_rate(),
            belt_state: self.belt.state(),
            belt_speed_mps: self.belt.nominal_speed_mps(),
            pending_fires: self.scheduler.pending_len(),
            diverters: self.pool.statuses(),
            bins: self.bins.states(),
            host: self.limits.readings(),
            faults: self.recovery.record_summary(),
        }
    }

    /// Metrics history slice (most recent `window` samples).
    pub fn metrics_window(&self, window: usize) -> Vec<MetricsSnapshot> {
        self.ring.window(window)
    }

    // ── Main loop ────────────────────────────────────────────────────────

    /// How long the runner may sleep before the next scheduled fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_fire_at()
    }

    /// Configured loop period for the runner.
    pub fn tick_period(&self) -> Duration {
        self.snapshot.tick
    }

    /// One orchestration iteration at the clock's current time.
    pub fn tick(&mut self) -> Result<()> {
        let now = self.clock.now();

        // 1. Snapshot swap happens only between iterations.
        if let Some(snap) = self.pending_snapshot.take() {
            self.apply_snapshot(snap);
        }

        // 2. Safety precedence: forced transitions drain before anything.
        for change in self.state.drain_forced(now) {
            self.publish_state_change(&change.from, &change.to, &change.reason);
        }

        // 3. E-stop sampling.
        if self.estop.poll() {
            self.handle_estop("emergency stop input asserted");
        }

        // 4. Maintenance auto-timeout.
        if self.state.current() == SystemState::Maintenance
            && now.saturating_duration_since(self.state.entered_at())
                >= self.snapshot.maintenance_timeout
        {
            let change = self
                .state
                .transition(SystemState::Idle, "maintenance timeout", now)?;
            self.publish_state_change(&change.from, &change.to, &change.reason);
        }

        // 5. Belt ramping.
        if let Err(e) = self.belt.tick(now) {
            self.report_fault(Fault::new(
                FaultKind::BeltFailure,
                "belt",
                Severity::Critical,
                e.to_string(),
                now,
            ));
        }

        // 6. Trigger intake (only creates work while running).
        let triggers: Vec<TriggerEvent> = self.trigger_rx.try_iter().collect();
        for trigger in triggers {
            if self.state.current() == SystemState::Running {
                self.process_trigger(trigger);
            } else {
                tracing::debug!(state = %self.state.current(), "ignoring trigger");
            }
        }

        // 7. Dispatch due fires.
        let generation = self.scheduler.generation();
        for due in self.scheduler.poll(now) {
            match due {
                Due::Fire(fire) => {
                    if let Err(fire) = self.pool.dispatch(fire, generation) {
                        self.actuation_rejected(fire, now);
                    }
                }
                Due::Stale(fire) => {
                    tracing::warn!(item_id = fire.item_id, "fire went stale in queue");
                    self.publish_drop(fire.item_id, fire.trigger_at, DropReason::Late);
                }
            }
        }

        // 8. Harvest actuation results.
        for result in self.pool.drain_results() {
            self.handle_fire_result(result, now);
        }

        // 9. Bin levels.
        if self.bins.due(now) {
            self.poll_bins(now);
        }

        // 10. Limits watchdog + metrics on the same cadence.
        let metrics_due = match self.last_metrics_at {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.snapshot.metrics_interval,
        };
        if metrics_due {
            self.last_metrics_at = Some(now);
            self.sample_limits(now);
            self.publish_metrics(now);
        }

        // 11. Shutdown drain.
        if self.state.current() == SystemState::ShuttingDown {
            let drained = self.scheduler.pending_len() == 0;
            let deadline_passed = self
                .shutdown_deadline
                .map(|d| now >= d)
                .unwrap_or(true);
            if drained || deadline_passed {
                if !drained {
                    let cancelled = self.scheduler.cancel_all();
                    self.pool.set_generation(self.scheduler.generation());
                    self.drop_cancelled(cancelled, DropReason::BeltNotReady);
                }
                self.pool.shutdown(self.snapshot.shutdown_drain);
                let change =
                    self.state
                        .transition(SystemState::Shutdown, "drain complete", now)?;
                self.publish_state_change(&change.from, &change.to, &change.reason);
            }
        }

        Ok(())
    }

    // ── Pipeline stages ──────────────────────────────────────────────────

    fn process_trigger(&mut self, trigger: TriggerEvent) {
        self.next_item_id += 1;
        let item_id = self.next_item_id;
        let now = self.clock.now();

        let frame = match self.camera.capture(self.snapshot.classify.budget) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(item_id, error = %e, "frame capture failed");
                self.counters.record_classify_error();
                self.pipeline_error();
                self.publish_drop(item_id, trigger.at, DropReason::ClassifierError);
                self.publish_alert(
                    Severity::Error,
                    FaultKind::CameraFailure,
                    "camera".to_string(),
                    e.to_string(),
                );
                self.report_fault(Fault::new(
                    FaultKind::CameraFailure,
                    "camera",
                    Severity::Error,
                    e.to_string(),
                    now,
                ));
                return;
            }
        };

        let classification = match self.classifier.classify(&frame) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(item_id, error = %e, "classification failed");
                self.counters.record_classify_error();
                self.pipeline_error();
                self.publish_drop(item_id, trigger.at, DropReason::ClassifierError);
                self.publish_alert(
                    Severity::Error,
                    FaultKind::AiModelFailure,
                    "classifier".to_string(),
                    e.to_string(),
                );
                self.report_fault(Fault::new(
                    FaultKind::AiModelFailure,
                    "classifier",
                    Severity::Error,
                    e.to_string(),
                    now,
                ));
                return;
            }
        };
        self.consecutive_errors = 0;

        let classify_at = self.clock.now();
        self.counters.record_classified(
            classification.category,
            classification.confidence,
            classify_at.saturating_duration_since(trigger.at),
        );

        let classified = ClassifiedItem {
            item_id,
            category: classification.category,
            trigger_at: trigger.at,
            classify_at,
            confidence: classification.confidence,
            bbox: classification.bbox,
        };

        let route = self.snapshot.routes.get(&classification.category);
        // A disabled diverter routes nothing; those items ride through.
        let route = route.filter(|_| self.pool.is_enabled(classification.category));
        let outcome = self.scheduler.schedule(
            &classified,
            classify_at,
            route,
            self.belt.nominal_speed_mps(),
            self.bins.accepting(classification.category),
        );

        match outcome {
            ScheduleOutcome::Scheduled { fire_at } => {
                tracing::info!(
                    item_id,
                    category = %classification.category,
                    confidence = classification.confidence,
                    fire_in_ms = fire_at.saturating_duration_since(classify_at).as_millis() as u64,
                    "fire scheduled"
                );
            }
            ScheduleOutcome::PassThrough => {
                let reason = if classification.low_confidence {
                    DropReason::LowConfidence
                } else {
                    DropReason::PassThrough
                };
                tracing::debug!(item_id, category = %classification.category, %reason, "pass-through");
                self.publish_drop(item_id, trigger.at, reason);
            }
            ScheduleOutcome::Dropped { reason } => {
                tracing::warn!(item_id, category = %classification.category, %reason, "item dropped");
                self.publish_drop(item_id, trigger.at, reason);
                if reason == DropReason::BinFull {
                    self.report_fault(Fault::new(
                        FaultKind::BinFull,
                        format!("bin-{}", classification.category),
                        Severity::Warn,
                        "destination bin full",
                        now,
                    ));
                }
            }
        }
    }

    fn handle_fire_result(&mut self, result: crate::diverter::FireResult, now: Instant) {
        let fire = result.fire;
        match result.outcome {
            Ok(op_count) => {
                self.counters.record_actuated(now);
                self.recovery
                    .on_recovered(FaultKind::HardwareFailure, &format!("diverter-{}", fire.category));
                self.bus.publish(Event::ItemActuated {
                    item_id: fire.item_id,
                    trigger_ns: self.ns(fire.trigger_at),
                    classify_ns: self.ns(fire.classify_at),
                    fire_ns: self.ns(fire.fire_at),
                    category: fire.category,
                    confidence: fire.confidence,
                    bbox: fire.bbox,
                    diverter_op_count: op_count,
                });
                if result.maintenance_due {
                    self.publish_alert(
                        Severity::Warn,
                        FaultKind::HardwareFailure,
                        format!("diverter-{}", fire.category),
                        format!("operation count {op_count} reached maintenance ceiling"),
                    );
                }
            }
            Err(message) => {
                self.counters.record_actuation_failure();
                self.publish_drop(fire.item_id, fire.trigger_at, DropReason::ActuationFailed);
                self.publish_alert(
                    Severity::Error,
                    FaultKind::HardwareFailure,
                    format!("diverter-{}", fire.category),
                    message.clone(),
                );
                self.report_fault(Fault::new(
                    FaultKind::HardwareFailure,
                    format!("diverter-{}", fire.category),
                    Severity::Error,
                    message,
                    now,
                ));
            }
        }
    }

    fn actuation_rejected(&mut self, fire: PendingFire, now: Instant) {
        tracing::error!(item_id = fire.item_id, category = %fire.category, "diverter busy, fire rejected");
        self.counters.record_actuation_failure();
        self.publish_drop(fire.item_id, fire.trigger_at, DropReason::ActuationFailed);
        self.report_fault(Fault::new(
            FaultKind::HardwareFailure,
            format!("diverter-{}", fire.category),
            Severity::Error,
            "activation already in flight",
            now,
        ));
    }

    fn poll_bins(&mut self, now: Instant) {
        let (changes, errors) = self.bins.poll(now);
        for change in changes {
            self.bus.publish(Event::BinChanged {
                category: change.category,
                fill_fraction: change.fill_fraction,
                state: change.to.as_str(),
            });
            match change.to {
                BinState::Critical => {
                    self.publish_alert(
                        Severity::Critical,
                        FaultKind::BinFull,
                        format!("bin-{}", change.category),
                        format!("bin at {:.0}%", change.fill_fraction * 100.0),
                    );
                }
                BinState::Full => {
                    self.publish_alert(
                        Severity::Warn,
                        FaultKind::BinFull,
                        format!("bin-{}", change.category),
                        format!("bin at {:.0}%", change.fill_fraction * 100.0),
                    );
                }
                _ => {}
            }
        }
        for err in errors {
            self.report_fault(Fault::new(
                FaultKind::SensorFailure,
                format!("bin-{}", err.category),
                Severity::Warn,
                err.message,
                now,
            ));
        }
    }

    fn sample_limits(&mut self, now: Instant) {
        let runtime = match (self.state.current(), self.run_started_at) {
            (SystemState::Running, Some(t)) => now.saturating_duration_since(t),
            _ => Duration::ZERO,
        };
        let items_last_hour = self.counters.items_last_hour_estimate(now);

        // Pipeline error rate rides the same cadence; alert on crossing only.
        let error_rate = self.counters.error_rate();
        if self.counters.items_processed >= 10 {
            let high = error_rate >= self.snapshot.limits.error_rate_warn;
            if high && !self.error_rate_high {
                self.publish_alert(
                    Severity::Warn,
                    FaultKind::AiModelFailure,
                    "pipeline".to_string(),
                    format!("error rate at {:.0}%", error_rate * 100.0),
                );
            }
            self.error_rate_high = high;
        }
        for event in self.limits.sample(runtime, items_last_hour) {
            match event {
                LimitEvent::Breached {
                    kind,
                    level,
                    value,
                    message,
                } => {
                    let fault_kind = match kind {
                        LimitKind::Temperature => FaultKind::HighTemperature,
                        LimitKind::Memory => FaultKind::MemoryLeak,
                        _ => FaultKind::HardwareFailure,
                    };
                    match level {
                        LimitLevel::Warn => {
                            self.publish_alert(
                                Severity::Warn,
                                fault_kind,
                                "host".to_string(),
                                message,
                            );
                            if self.state.current() == SystemState::Running {
                                self.state.force(SystemState::Paused, format!("limit:{}", kind.as_str()));
                                self.paused_by_limit = Some(kind);
                                let _ = self.belt.pause(now);
                                for change in self.state.drain_forced(now) {
                                    self.publish_state_change(&change.from, &change.to, &change.reason);
                                }
                            }
                        }
                        LimitLevel::Critical => {
                            self.publish_alert(
                                Severity::Critical,
                                fault_kind,
                                "host".to_string(),
                                message,
                            );
                            tracing::error!(kind = kind.as_str(), value, "critical limit breach");
                            self.fail_system(format!("limit:{}", kind.as_str()), now);
                        }
                    }
                }
                LimitEvent::Cleared { kind } => {
                    self.publish_alert(
                        Severity::Info,
                        FaultKind::HighTemperature,
                        "host".to_string(),
                        format!("{} back under threshold", kind.as_str()),
                    );
                    if self.paused_by_limit == Some(kind)
                        && self.state.current() == SystemState::Paused
                    {
                        if let Err(e) = self.resume() {
                            tracing::warn!(error = %e, "auto-resume after limit clear failed");
                        }
                    }
                }
            }
        }
    }

    fn publish_metrics(&mut self, now: Instant) {
        let host = self.limits.readings();
        let snap = MetricsSnapshot {
            wall_ts: chrono::Utc::now(),
            uptime_s: now.saturating_duration_since(self.started_wall).as_secs_f64(),
            items_processed: self.counters.items_processed,
            items_actuated: self.counters.items_actuated,
            items_dropped: self.counters.items_dropped,
            items_per_minute: self.counters.items_per_minute(now),
            avg_confidence: self.counters.avg_confidence(),
            avg_processing_ms: self.counters.avg_processing_ms(),
            error_rate: self.counters.error_rate(),
            per_category: self.counters.per_category().clone(),
            cpu_pct: host.cpu_pct,
            mem_pct: host.mem_pct,
            temp_c: host.temp_c,
        };
        self.ring.push(snap.clone());
        self.bus.publish(Event::Metrics(snap));
    }

    // ── Faults and recovery ──────────────────────────────────────────────

    fn pipeline_error(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.snapshot.max_processing_errors {
            let now = self.clock.now();
            tracing::error!(
                consecutive = self.consecutive_errors,
                "too many consecutive pipeline errors"
            );
            self.consecutive_errors = 0;
            self.fail_system("consecutive pipeline errors", now);
        }
    }

    fn report_fault(&mut self, fault: Fault) {
        let now = fault.at;
        let action = self.recovery.on_fault(&fault, now);
        tracing::warn!(
            kind = %fault.kind,
            component = %fault.component,
            action = ?action,
            "fault reported"
        );
        match action {
            RecoveryAction::Defer | RecoveryAction::None => {}
            RecoveryAction::Escalate => {
                self.publish_alert(
                    Severity::Critical,
                    fault.kind,
                    fault.component.clone(),
                    format!("recovery escalated: {}", fault.message),
                );
                self.fail_system(format!("{} escalated", fault.kind), now);
            }
            RecoveryAction::Pause => {
                if self.state.current() == SystemState::Running {
                    let _ = self.pause(&format!("fault:{}", fault.kind));
                }
            }
            RecoveryAction::Disable => {
                self.apply_disable(&fault);
            }
            RecoveryAction::Retry | RecoveryAction::Restart | RecoveryAction::Failover => {
                self.attempt_recovery(&fault, action, now);
            }
        }
    }

    /// Run one recovery attempt, walking running -> recovering -> running
    /// when the attempt succeeds (or back to the pre-fault state).
    fn attempt_recovery(&mut self, fault: &Fault, action: RecoveryAction, now: Instant) {
        self.counters.recovery_attempts += 1;

        // Hardware and sensor retries cannot be validated here; the next
        // activation (or bin read) settles them, and its success path calls
        // on_recovered.
        if matches!(
            fault.kind,
            FaultKind::HardwareFailure | FaultKind::SensorFailure
        ) {
            tracing::debug!(kind = %fault.kind, "recovery deferred to next operation");
            return;
        }

        let was = self.state.current();
        let entered_recovering = if was == SystemState::Running {
            match self
                .state
                .transition(SystemState::Recovering, fault.kind.as_str(), now)
            {
                Ok(change) => {
                    self.publish_state_change(&change.from, &change.to, &change.reason);
                    self.pre_fault_state = was;
                    true
                }
                Err(_) => false,
            }
        } else {
            false
        };

        let ok = match (fault.kind, &action) {
            (FaultKind::CameraFailure, RecoveryAction::Failover) => self.failover_camera(),
            (FaultKind::CameraFailure, _) => self.probe_camera(),
            (FaultKind::AiModelFailure, RecoveryAction::Failover) => self.failover_model(),
            (FaultKind::AiModelFailure, _) => self.classifier.probe().is_ok(),
            (FaultKind::MemoryLeak, RecoveryAction::Restart) => true,
            _ => false,
        };

        if ok {
            self.counters.successful_recoveries += 1;
            self.recovery.on_recovered(fault.kind, &fault.component);
            tracing::info!(kind = %fault.kind, component = %fault.component, "recovery succeeded");
            if entered_recovering {
                // Default policy: return to the pre-fault state.
                match self
                    .state
                    .transition(self.pre_fault_state, "recovery complete", now)
                {
                    Ok(change) => {
                        self.publish_state_change(&change.from, &change.to, &change.reason)
                    }
                    Err(e) => tracing::warn!(error = %e, "could not restore pre-fault state"),
                }
            }
        } else {
            // A failed attempt is not an escalation by itself; the ladder
            // (or the global budget) decides that on the next fault. Walk
            // back so the pipeline keeps running between attempts.
            tracing::error!(kind = %fault.kind, component = %fault.component, "recovery attempt failed");
            if entered_recovering {
                match self
                    .state
                    .transition(self.pre_fault_state, "recovery attempt failed", now)
                {
                    Ok(change) => {
                        self.publish_state_change(&change.from, &change.to, &change.reason)
                    }
                    Err(e) => tracing::warn!(error = %e, "could not restore pre-fault state"),
                }
            }
        }
    }

    fn apply_disable(&mut self, fault: &Fault) {
        match fault.kind {
            FaultKind::HardwareFailure => {
                // diverter-<category> naming is fixed by this module.
                if let Some(cat) = fault
                    .component
                    .strip_prefix("diverter-")
                    .and_then(|c| c.parse::<Category>().ok())
                {
                    self.pool.disable(cat);
                    self.publish_alert(
                        Severity::Error,
                        fault.kind,
                        fault.component.clone(),
                        "diverter disabled after repeated faults".to_string(),
                    );
                }
            }
            FaultKind::SensorFailure => {
                // Bin sensors degrade in place; nothing else to do here.
                tracing::warn!(component = %fault.component, "sensor excluded from decisions");
            }
            _ => {}
        }
    }

    fn failover_camera(&mut self) -> bool {
        let Some(next) = self.backup_cameras.pop_front() else {
            tracing::warn!("no backup camera available");
            return false;
        };
        let old = std::mem::replace(&mut self.camera, next);
        self.backup_cameras.push_back(old);
        tracing::info!("switched to backup camera");
        self.probe_camera()
    }

    fn probe_camera(&mut self) -> bool {
        self.camera.capture(self.snapshot.classify.budget).is_ok()
    }

    fn failover_model(&mut self) -> bool {
        let Some(backup) = self.backup_classifier.take() else {
            tracing::warn!("no backup model available");
            return false;
        };
        let old = self.classifier.swap_backend(backup);
        self.backup_classifier = Some(old);
        tracing::info!("switched to backup model");
        self.classifier.probe().is_ok()
    }

    /// Shared error path: stop producing work, keep status APIs alive.
    fn fail_system(&mut self, reason: impl Into<String>, now: Instant) {
        let reason = reason.into();
        let _ = self.belt.stop(true, now);
        let cancelled = self.scheduler.cancel_all();
        self.pool.set_generation(self.scheduler.generation());
        self.drop_cancelled(cancelled, DropReason::BeltNotReady);
        self.state.force(SystemState::Error, reason);
        for change in self.state.drain_forced(now) {
            self.publish_state_change(&change.from, &change.to, &change.reason);
        }
        self.run_started_at = None;
    }

    fn handle_estop(&mut self, message: &str) {
        let now = self.clock.now();
        tracing::error!("EMERGENCY STOP: {message}");
        self.publish_alert(
            Severity::Critical,
            FaultKind::EStop,
            "estop".to_string(),
            message.to_string(),
        );
        let _ = self.belt.emergency_stop();
        let cancelled = self.scheduler.cancel_all();
        self.pool.set_generation(self.scheduler.generation());
        self.drop_cancelled(cancelled, DropReason::BeltNotReady);
        self.pool.disable_all();
        self.state.force(SystemState::Error, "E_STOP");
        for change in self.state.drain_forced(now) {
            self.publish_state_change(&change.from, &change.to, &change.reason);
        }
        self.run_started_at = None;
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn apply_snapshot(&mut self, snap: Arc<Snapshot>) {
        self.scheduler.set_cfg(snap.schedule.clone());
        self.belt.set_cfg(snap.belt.clone());
        self.classifier.set_cfg(snap.classify.clone());
        self.limits.set_cfg(snap.limits.clone());
        self.recovery.set_cfg(snap.recovery.clone());
        self.bins.set_cfg(snap.bins.clone());
        self.snapshot = snap;
        tracing::info!("configuration snapshot applied");
    }

    fn drop_cancelled(&mut self, cancelled: Vec<PendingFire>, reason: DropReason) {
        for fire in cancelled {
            self.publish_drop(fire.item_id, fire.trigger_at, reason);
        }
    }

    fn publish_drop(&mut self, item_id: u64, trigger_at: Instant, reason: DropReason) {
        self.counters.record_dropped();
        self.bus.publish(Event::ItemDropped {
            item_id,
            trigger_ns: self.ns(trigger_at),
            reason,
        });
    }

    fn publish_alert(
        &self,
        severity: Severity,
        kind: FaultKind,
        component: String,
        message: String,
    ) {
        self.bus.publish(Event::Alert {
            severity,
            kind,
            component,
            message,
        });
    }

    fn publish_state_change(&self, from: &SystemState, to: &SystemState, reason: &str) {
        self.bus.publish(Event::StateChanged {
            from: *from,
            to: *to,
            reason: reason.to_string(),
        });
    }

    fn ns(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch)
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Plain builder; `build()` validates required parts, initializes actuators
/// leaf-first, runs the startup sanity checks, and lands the machine in
/// `idle`.
#[derive(Default)]
pub struct OrchestratorBuilder {
    snapshot: Option<Arc<Snapshot>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    belt_drive: Option<Box<dyn BeltDrive + Send>>,
    camera: Option<Box<dyn FrameSource + Send>>,
    backup_cameras: VecDeque<Box<dyn FrameSource + Send>>,
    classifier: Option<Box<dyn Classifier + Send>>,
    backup_classifier: Option<Box<dyn Classifier + Send>>,
    probe: Option<Box<dyn SystemProbe + Send>>,
    estop_check: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    trigger_rx: Option<xch::Receiver<TriggerEvent>>,
    diverters: Vec<(Category, Box<dyn Actuator + Send>)>,
    bins: Vec<(Category, Box<dyn LevelSensor + Send>, f32, f32)>,
}

impl OrchestratorBuilder {
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(Arc::new(snapshot));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_belt_drive(mut self, drive: Box<dyn BeltDrive + Send>) -> Self {
        self.belt_drive = Some(drive);
        self
    }

    pub fn with_camera(mut self, camera: Box<dyn FrameSource + Send>) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_backup_camera(mut self, camera: Box<dyn FrameSource + Send>) -> Self {
        self.backup_cameras.push_back(camera);
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier + Send>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_backup_classifier(mut self, classifier: Box<dyn Classifier + Send>) -> Self {
        self.backup_classifier = Some(classifier);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn SystemProbe + Send>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_estop_check(mut self, check: Box<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.estop_check = Some(check);
        self
    }

    pub fn with_trigger_source(mut self, rx: xch::Receiver<TriggerEvent>) -> Self {
        self.trigger_rx = Some(rx);
        self
    }

    pub fn with_diverter(mut self, category: Category, actuator: Box<dyn Actuator + Send>) -> Self {
        self.diverters.push((category, actuator));
        self
    }

    pub fn with_bin(
        mut self,
        category: Category,
        sensor: Box<dyn LevelSensor + Send>,
        empty_m: f32,
        full_m: f32,
    ) -> Self {
        self.bins.push((category, sensor, empty_m, full_m));
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let snapshot = self.snapshot.unwrap_or_default();
        let clock: Arc<dyn Clock + Send + Sync> = self
            .clock
            .unwrap_or_else(|| Arc::new(beltsort_traits::MonotonicClock::new()));
        let belt_drive = self
            .belt_drive
            .ok_or_else(|| eyre::Report::new(BuildError::MissingBelt))?;
        let camera = self
            .camera
            .ok_or_else(|| eyre::Report::new(BuildError::MissingCamera))?;
        let classifier = self
            .classifier
            .ok_or_else(|| eyre::Report::new(BuildError::MissingClassifier))?;
        if self.diverters.is_empty() {
            return Err(eyre::Report::new(BuildError::NoDiverters));
        }

        let now = clock.now();
        let bus = TelemetryBus::new();
        let mut state = StateMachine::new(now);

        // Leaf-first bring-up: actuators, bins, belt, then the supervisors.
        let mut pool = DiverterPool::new();
        for (category, mut actuator) in self.diverters {
            actuator
                .initialize()
                .map_err(|e| eyre::Report::new(SorterError::Hardware(e.to_string())))
                .wrap_err_with(|| format!("initializing diverter {category}"))?;
            let max_ops = snapshot.routes.get(&category).and_then(|r| r.max_operations);
            pool.add_diverter(category, actuator, max_ops);
        }

        let mut bins = BinMonitor::new(snapshot.bins.clone());
        for (category, sensor, empty_m, full_m) in self.bins {
            bins.add_bin(category, sensor, empty_m, full_m);
        }

        let belt = BeltController::new(belt_drive, snapshot.belt.clone());
        let classifier = ClassifierClient::new(classifier, snapshot.classify.clone());
        let probe: Box<dyn SystemProbe + Send> = self
            .probe
            .unwrap_or_else(|| Box::new(NullProbe));
        let mut limits = LimitsWatchdog::new(probe, snapshot.limits.clone());

        // Startup requirement check: refuse to come up already overheated.
        let _ = limits.sample(Duration::ZERO, 0);
        let readings = limits.readings();
        if readings.temp_c >= snapshot.limits.temp_crit_c {
            let change = state.transition(SystemState::Error, "overtemperature at boot", now)?;
            bus.publish(Event::StateChanged {
                from: change.from,
                to: change.to,
                reason: change.reason.clone(),
            });
            return Err(eyre::Report::new(SorterError::State(format!(
                "host temperature {:.1}°C above critical threshold at startup",
                readings.temp_c
            ))));
        }

        let estop = EstopMonitor::new(self.estop_check, snapshot.estop_debounce_n);
        let recovery = RecoverySupervisor::new(snapshot.recovery.clone());
        let scheduler = DispatchScheduler::new(snapshot.schedule.clone());
        let ring = MetricsRing::new(snapshot.metrics_history);

        let trigger_rx = self.trigger_rx.unwrap_or_else(|| {
            let (_tx, rx) = xch::bounded(0);
            rx
        });

        let change = state.transition(SystemState::Idle, "initialization complete", now)?;
        bus.publish(Event::StateChanged {
            from: change.from,
            to: change.to,
            reason: change.reason.clone(),
        });

        Ok(Orchestrator {
            epoch: now,
            clock,
            snapshot,
            pending_snapshot: None,
            state,
            bus,
            scheduler,
            pool,
            belt,
            bins,
            classifier,
            backup_classifier: self.backup_classifier,
            camera,
            backup_cameras: self.backup_cameras,
            estop,
            limits,
            recovery,
            counters: Counters::default(),
            ring,
            trigger_rx,
            next_item_id: 0,
            consecutive_errors: 0,
            run_started_at: None,
            started_wall: now,
            last_metrics_at: None,
            paused_by_limit: None,
            pre_fault_state: SystemState::Idle,
            shutdown_deadline: None,
            error_rate_high: false,
        })
    }
}

/// Probe used when none is configured (simulation, tests).
struct NullProbe;

impl SystemProbe for NullProbe {
    fn cpu_percent(&mut self) -> std::result::Result<f32, beltsort_traits::BoxError> {
        Ok(0.0)
    }
    fn memory_percent(&mut self) -> std::result::Result<f32, beltsort_traits::BoxError> {
        Ok(0.0)
    }
    fn temperature_c(&mut self) -> std::result::Result<f32, beltsort_traits::BoxError> {
        Ok(0.0)
    }
}
