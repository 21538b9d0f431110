//! End-to-end pipeline scenarios on a virtual clock (belt at 0.15 m/s).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beltsort_core::{
    BeltCfg, CategoryRoute, DropReason, Event, FaultKind, Orchestrator, OverflowPolicy,
    RecoveryCfg, Severity, Snapshot, Subscription, SystemState, TriggerEvent,
};
use beltsort_hardware::{SimBeltDrive, SimCamera, SimClassifier, SimDiverter, SimLevelSensor};
use beltsort_traits::clock::test_clock::TestClock;
use beltsort_traits::{Category, Clock};
use crossbeam_channel as xch;

fn base_snapshot() -> Snapshot {
    let mut snap = Snapshot::default();
    for (cat, dist) in [
        (Category::Metal, 0.60),
        (Category::Plastic, 0.80),
        (Category::Glass, 1.00),
    ] {
        snap.routes.insert(
            cat,
            CategoryRoute {
                distance_m: dist,
                activation: Duration::from_millis(750),
                lead: Duration::ZERO,
                max_operations: None,
            },
        );
    }
    snap.belt = BeltCfg {
        nominal_mps: 0.15,
        min_duty: 20.0,
        max_duty: 100.0,
        accel: Duration::ZERO,
        decel: Duration::ZERO,
    };
    snap.recovery = RecoveryCfg {
        max_consecutive: 1,
        cooldown: Duration::ZERO,
        global_budget: 100,
        ..RecoveryCfg::default()
    };
    snap
}

struct Rig {
    clock: TestClock,
    orch: Orchestrator,
    trigger_tx: xch::Sender<TriggerEvent>,
    diverters: HashMap<Category, SimDiverter>,
    classifier: SimClassifier,
    glass_sensor: SimLevelSensor,
    estop: Arc<AtomicBool>,
    events: Subscription,
}

impl Rig {
    fn new(snapshot: Snapshot, backup_classifier: Option<SimClassifier>) -> Self {
        let clock = TestClock::new();
        let (trigger_tx, trigger_rx) = xch::bounded(64);
        let classifier = SimClassifier::new("other", 0.9);
        let glass_sensor = SimLevelSensor::new(1.0); // empty
        let estop = Arc::new(AtomicBool::new(false));
        let estop_bg = estop.clone();

        let mut diverters = HashMap::new();
        let mut builder = Orchestrator::builder()
            .with_snapshot(snapshot)
            .with_clock(Arc::new(clock.clone()))
            .with_belt_drive(Box::new(SimBeltDrive::new()))
            .with_camera(Box::new(SimCamera::new()))
            .with_classifier(Box::new(classifier.clone()))
            .with_estop_check(Box::new(move || estop_bg.load(Ordering::Relaxed)))
            .with_trigger_source(trigger_rx)
            .with_bin(Category::Glass, Box::new(glass_sensor.clone()), 1.0, 0.0);
        for cat in [Category::Metal, Category::Plastic, Category::Glass] {
            let d = SimDiverter::new();
            diverters.insert(cat, d.clone());
            builder = builder.with_diverter(cat, Box::new(d));
        }
        if let Some(backup) = backup_classifier {
            builder = builder.with_backup_classifier(Box::new(backup));
        }
        let orch = builder.build().expect("build orchestrator");
        let events = orch.subscribe("test", None, 1024, OverflowPolicy::DropOldest);
        Self {
            clock,
            orch,
            trigger_tx,
            diverters,
            classifier,
            glass_sensor,
            estop,
            events,
        }
    }

    fn tick(&mut self) {
        self.orch.tick().expect("tick");
    }

    fn trigger_now(&mut self) {
        let at = self.clock.now();
        self.trigger_tx
            .send(TriggerEvent { at })
            .expect("send trigger");
    }

    /// Advance virtual time in small steps, ticking each step.
    fn run_for(&mut self, total: Duration) {
        let step = Duration::from_millis(25);
        let mut left = total;
        while !left.is_zero() {
            let d = step.min(left);
            self.clock.advance(d);
            self.tick();
            left -= d;
        }
    }

    /// Let diverter worker threads (real time) report back.
    fn settle(&mut self) {
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(2));
            self.tick();
        }
    }

    fn drain_events(&mut self) -> Vec<Event> {
        self.events.rx.try_iter().collect()
    }
}

fn actuated_of(events: &[Event]) -> Vec<(u64, Category, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ItemActuated {
                item_id,
                category,
                fire_ns,
                ..
            } => Some((*item_id, *category, *fire_ns)),
            _ => None,
        })
        .collect()
}

fn drops_of(events: &[Event]) -> Vec<(u64, DropReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ItemDropped {
                item_id, reason, ..
            } => Some((*item_id, *reason)),
            _ => None,
        })
        .collect()
}

fn state_changes(events: &[Event]) -> Vec<(SystemState, SystemState)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[test]
fn happy_path_metal_fires_at_four_seconds() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.classifier.push_detection("metal", 0.9);

    rig.orch.start().expect("start");
    rig.tick(); // belt ramp completes (accel = 0)

    rig.trigger_now();
    rig.run_for(Duration::from_millis(4100));
    rig.settle();

    let events = rig.drain_events();
    let actuated = actuated_of(&events);
    assert_eq!(actuated.len(), 1, "expected one actuation: {events:?}");
    let (_, category, fire_ns) = actuated[0];
    assert_eq!(category, Category::Metal);
    // 0.60 m / 0.15 m/s = 4.00 s from trigger
    let fire_s = fire_ns as f64 / 1e9;
    assert!((fire_s - 4.0).abs() < 0.1, "fire at {fire_s:.3}s");
    assert_eq!(rig.diverters[&Category::Metal].activation_count(), 1);
}

#[test]
fn late_classification_drops_late() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.classifier.push_detection("plastic", 0.8);

    rig.orch.start().expect("start");
    rig.tick();

    // Trigger now, but the event is only processed six seconds later:
    // plastic's fire deadline (5.33 s) has already passed.
    rig.trigger_now();
    rig.clock.advance(Duration::from_secs(6));
    rig.tick();
    rig.settle();

    let events = rig.drain_events();
    assert_eq!(drops_of(&events), vec![(1, DropReason::Late)]);
    assert!(actuated_of(&events).is_empty());
    assert_eq!(rig.diverters[&Category::Plastic].activation_count(), 0);
}

#[test]
fn full_glass_bin_gates_scheduling() {
    let mut rig = Rig::new(base_snapshot(), None);
    // 0.04 m from an empty=1.0/full=0.0 span => 96% fill, past critical.
    rig.glass_sensor.set_distance(0.04);
    rig.classifier.push_detection("glass", 0.95);

    rig.orch.start().expect("start");
    rig.tick(); // first bin poll reads 96%

    rig.trigger_now();
    rig.run_for(Duration::from_secs(8));
    rig.settle();

    let events = rig.drain_events();
    assert!(drops_of(&events).contains(&(1, DropReason::BinFull)));
    assert_eq!(rig.diverters[&Category::Glass].activation_count(), 0);
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::Alert {
                severity: Severity::Critical,
                kind: FaultKind::BinFull,
                ..
            }
        )),
        "expected critical bin alert"
    );
}

#[test]
fn estop_mid_flight_cancels_scheduled_fire() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.classifier.push_detection("metal", 0.9);

    rig.orch.start().expect("start");
    rig.tick();

    rig.trigger_now(); // fire would land at t = 4.0 s
    rig.run_for(Duration::from_secs(3));

    rig.estop.store(true, Ordering::Relaxed);
    rig.tick(); // first asserted sample
    rig.tick(); // debounce_n = 2 latches here

    assert_eq!(rig.orch.state(), SystemState::Error);

    rig.run_for(Duration::from_secs(2));
    rig.settle();

    let events = rig.drain_events();
    assert!(
        state_changes(&events).contains(&(SystemState::Running, SystemState::Error)),
        "expected running -> error: {events:?}"
    );
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Alert {
            severity: Severity::Critical,
            kind: FaultKind::EStop,
            ..
        }
    )));
    assert!(actuated_of(&events).is_empty());
    assert_eq!(rig.diverters[&Category::Metal].activation_count(), 0);
    // The cancelled fire still terminates its item.
    assert!(!drops_of(&events).is_empty());
}

#[test]
fn congestion_serializes_when_grace_allows() {
    let mut snap = base_snapshot();
    snap.schedule.grace = Duration::from_secs(2);
    let mut rig = Rig::new(snap, None);

    rig.orch.start().expect("start");
    rig.tick();

    // Plastic triggered first (fire at 5.333 s), metal timed so its fire
    // lands 10 ms later, overlapping the plastic window.
    rig.classifier.push_detection("plastic", 0.8);
    rig.trigger_now();
    rig.tick();

    rig.run_for(Duration::from_millis(1343) + Duration::from_micros(333));
    rig.classifier.push_detection("metal", 0.9);
    rig.trigger_now();

    rig.run_for(Duration::from_secs(7));
    rig.settle();

    let events = rig.drain_events();
    let actuated = actuated_of(&events);
    assert_eq!(actuated.len(), 2, "both items actuate: {events:?}");
    let fire_plastic = actuated
        .iter()
        .find(|(_, c, _)| *c == Category::Plastic)
        .unwrap()
        .2;
    let fire_metal = actuated
        .iter()
        .find(|(_, c, _)| *c == Category::Metal)
        .unwrap()
        .2;
    // Serialized by at least activation (750 ms) + gap (200 ms).
    assert!(fire_metal >= fire_plastic + 950_000_000);
}

#[test]
fn congestion_drops_second_item_when_offset_would_be_late() {
    let mut rig = Rig::new(base_snapshot(), None); // default grace 50 ms

    rig.orch.start().expect("start");
    rig.tick();

    rig.classifier.push_detection("plastic", 0.8);
    rig.trigger_now();
    rig.tick();

    rig.run_for(Duration::from_millis(1343) + Duration::from_micros(333));
    rig.classifier.push_detection("metal", 0.9);
    rig.trigger_now();

    rig.run_for(Duration::from_secs(7));
    rig.settle();

    let events = rig.drain_events();
    let actuated = actuated_of(&events);
    assert_eq!(actuated.len(), 1);
    assert_eq!(actuated[0].1, Category::Plastic);
    assert!(drops_of(&events).iter().any(|(_, r)| *r == DropReason::Congested));
}

#[test]
fn classifier_failover_recovers_to_running() {
    let backup = SimClassifier::new("metal", 0.9);
    let mut rig = Rig::new(base_snapshot(), Some(backup));

    // Primary model: item 1 fails, the recovery probe fails, item 2 fails;
    // the second fault moves the ladder to failover and the backup takes over.
    rig.classifier.push_result(Err("model inference error".into()));
    rig.classifier.push_result(Err("model inference error".into()));
    rig.classifier.push_result(Err("model inference error".into()));

    rig.orch.start().expect("start");
    rig.tick();

    rig.trigger_now();
    rig.tick();
    rig.run_for(Duration::from_millis(100));
    rig.trigger_now();
    rig.tick();

    assert_eq!(rig.orch.state(), SystemState::Running);

    // Third item classifies on the backup model and schedules normally.
    rig.run_for(Duration::from_millis(100));
    rig.trigger_now();
    rig.run_for(Duration::from_secs(5));
    rig.settle();

    let events = rig.drain_events();
    let model_alerts = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::Alert {
                    kind: FaultKind::AiModelFailure,
                    ..
                }
            )
        })
        .count();
    assert!(model_alerts >= 2, "expected at least two model alerts");

    let changes = state_changes(&events);
    assert!(changes.contains(&(SystemState::Running, SystemState::Recovering)));
    assert!(changes.contains(&(SystemState::Recovering, SystemState::Running)));

    assert_eq!(rig.diverters[&Category::Metal].activation_count(), 1);
}

#[test]
fn belt_not_ready_while_ramping() {
    let mut snap = base_snapshot();
    snap.belt.accel = Duration::from_secs(10);
    let mut rig = Rig::new(snap, None);
    rig.classifier.push_detection("metal", 0.9);

    rig.orch.start().expect("start");
    // Belt still accelerating: nominal speed is zero.
    rig.trigger_now();
    rig.tick();
    rig.settle();

    let events = rig.drain_events();
    assert_eq!(drops_of(&events), vec![(1, DropReason::BeltNotReady)]);
}

#[test]
fn maintenance_round_trip_returns_to_idle() {
    let mut rig = Rig::new(base_snapshot(), None);
    assert_eq!(rig.orch.state(), SystemState::Idle);

    rig.orch.enter_maintenance().expect("enter");
    assert_eq!(rig.orch.state(), SystemState::Maintenance);
    rig.orch.exit_maintenance().expect("exit");
    assert_eq!(rig.orch.state(), SystemState::Idle);

    let events = rig.drain_events();
    let changes = state_changes(&events);
    assert!(changes.contains(&(SystemState::Idle, SystemState::Maintenance)));
    assert!(changes.contains(&(SystemState::Maintenance, SystemState::Idle)));
}

#[test]
fn maintenance_times_out_back_to_idle() {
    let mut snap = base_snapshot();
    snap.maintenance_timeout = Duration::from_secs(60);
    let mut rig = Rig::new(snap, None);

    rig.orch.enter_maintenance().expect("enter");
    rig.run_for(Duration::from_secs(61));
    assert_eq!(rig.orch.state(), SystemState::Idle);
}

#[test]
fn reloading_identical_snapshot_is_observably_a_noop() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.orch.start().expect("start");
    rig.run_for(Duration::from_millis(100));
    rig.drain_events();

    rig.orch.reload(Arc::new(base_snapshot()));
    rig.tick();

    let events = rig.drain_events();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, Event::StateChanged { .. } | Event::Alert { .. })),
        "reload must not change state or alert: {events:?}"
    );
    assert_eq!(rig.orch.state(), SystemState::Running);
}

#[test]
fn estop_requires_release_before_acknowledge() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.orch.start().expect("start");
    rig.tick();

    rig.estop.store(true, Ordering::Relaxed);
    rig.tick();
    rig.tick();
    assert_eq!(rig.orch.state(), SystemState::Error);

    // Still pressed: acknowledge refused, restart refused.
    assert!(rig.orch.acknowledge().is_err());

    rig.estop.store(false, Ordering::Relaxed);
    rig.orch.acknowledge().expect("acknowledge after release");
    assert_eq!(rig.orch.state(), SystemState::Idle);
    rig.orch.start().expect("start again");
    assert_eq!(rig.orch.state(), SystemState::Running);
}

#[test]
fn stop_drains_and_reaches_shutdown() {
    let mut rig = Rig::new(base_snapshot(), None);
    rig.classifier.push_detection("metal", 0.9);
    rig.orch.start().expect("start");
    rig.tick();
    rig.trigger_now();
    rig.tick();

    rig.orch.stop().expect("stop");
    assert_eq!(rig.orch.state(), SystemState::ShuttingDown);
    rig.run_for(Duration::from_secs(6));
    rig.settle();
    assert_eq!(rig.orch.state(), SystemState::Shutdown);

    let events = rig.drain_events();
    let changes = state_changes(&events);
    assert!(changes.contains(&(SystemState::ShuttingDown, SystemState::Shutdown)));
}
