//! Bin fill monitor: polls ultrasonic level sensors, smooths readings, and
//! gates scheduling for categories whose destination bin is full.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use beltsort_traits::{Category, LevelSensor};

use crate::config::BinCfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BinState {
    Ok,
    Warn,
    Full,
    Critical,
}

impl BinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinState::Ok => "ok",
            BinState::Warn => "warn",
            BinState::Full => "full",
            BinState::Critical => "critical",
        }
    }
}

/// Emitted when a bin's fill state moves.
#[derive(Debug, Clone)]
pub struct BinChange {
    pub category: Category,
    pub fill_fraction: f32,
    pub from: BinState,
    pub to: BinState,
}

/// A sensor read failure the caller should report as a fault.
#[derive(Debug, Clone)]
pub struct BinSensorError {
    pub category: Category,
    pub message: String,
}

struct BinUnit {
    category: Category,
    sensor: Box<dyn LevelSensor + Send>,
    empty_m: f32,
    full_m: f32,
    window: VecDeque<f32>,
    fill_pct: f32,
    state: BinState,
    degraded: bool,
    consecutive_errors: u32,
}

impl BinUnit {
    /// Map a distance reading to fill percent via the linear empty/full span.
    fn fill_from_distance(&self, d: f32) -> f32 {
        let span = self.empty_m - self.full_m;
        if span <= 0.0 {
            return 0.0;
        }
        ((self.empty_m - d) / span * 100.0).clamp(0.0, 100.0)
    }

    fn next_state(&self, cfg: &BinCfg, fill: f32) -> BinState {
        // Entry thresholds are inclusive; leaving `full` requires dropping
        // below warn - 5 so a sloshing surface doesn't flap the gate.
        match self.state {
            BinState::Full | BinState::Critical => {
                if fill >= cfg.crit_pct {
                    BinState::Critical
                } else if fill >= cfg.full_pct {
                    BinState::Full
                } else if fill < cfg.warn_pct - 5.0 {
                    BinState::Ok
                } else {
                    // Inside the hysteresis band: hold full.
                    BinState::Full
                }
            }
            _ => {
                if fill >= cfg.crit_pct {
                    BinState::Critical
                } else if fill >= cfg.full_pct {
                    BinState::Full
                } else if fill >= cfg.warn_pct {
                    BinState::Warn
                } else {
                    BinState::Ok
                }
            }
        }
    }
}

pub struct BinMonitor {
    units: Vec<BinUnit>,
    cfg: BinCfg,
    last_poll: Option<Instant>,
}

impl BinMonitor {
    pub fn new(cfg: BinCfg) -> Self {
        Self {
            units: Vec::new(),
            cfg,
            last_poll: None,
        }
    }

    pub fn set_cfg(&mut self, cfg: BinCfg) {
        self.cfg = cfg;
    }

    pub fn add_bin(
        &mut self,
        category: Category,
        sensor: Box<dyn LevelSensor + Send>,
        empty_m: f32,
        full_m: f32,
    ) {
        self.units.push(BinUnit {
            category,
            sensor,
            empty_m,
            full_m,
            window: VecDeque::new(),
            fill_pct: 0.0,
            state: BinState::Ok,
            degraded: false,
            consecutive_errors: 0,
        });
    }

    pub fn due(&self, now: Instant) -> bool {
        match self.last_poll {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.cfg.poll_interval,
        }
    }

    /// Measure every bin once. Returns state changes plus sensor errors for
    /// the caller to convert into faults.
    pub fn poll(&mut self, now: Instant) -> (Vec<BinChange>, Vec<BinSensorError>) {
        self.last_poll = Some(now);
        let mut changes = Vec::new();
        let mut errors = Vec::new();

        for unit in &mut self.units {
            match unit.sensor.measure(self.cfg.measure_timeout) {
                Ok(d) => {
                    unit.consecutive_errors = 0;
                    unit.degraded = false;
                    unit.window.push_back(d);
                    while unit.window.len() > self.cfg.smoothing_samples {
                        unit.window.pop_front();
                    }
                    let avg = unit.window.iter().sum::<f32>() / unit.window.len() as f32;
                    unit.fill_pct = unit.fill_from_distance(avg);
                    let next = unit.next_state(&self.cfg, unit.fill_pct);
                    if next != unit.state {
                        changes.push(BinChange {
                            category: unit.category,
                            fill_fraction: unit.fill_pct / 100.0,
                            from: unit.state,
                            to: next,
                        });
                        unit.state = next;
                    }
                }
                Err(e) => {
                    unit.consecutive_errors += 1;
                    // Degraded sensors are excluded from gating decisions.
                    unit.degraded = true;
                    errors.push(BinSensorError {
                        category: unit.category,
                        message: e.to_string(),
                    });
                }
            }
        }
        (changes, errors)
    }

    /// Scheduling gate: false when the category's bin is full or critical.
    /// Unknown or degraded bins do not block.
    pub fn accepting(&self, category: Category) -> bool {
        self.units
            .iter()
            .find(|u| u.category == category)
            .map(|u| u.degraded || u.state < BinState::Full)
            .unwrap_or(true)
    }

    pub fn states(&self) -> HashMap<Category, (f32, BinState)> {
        self.units
            .iter()
            .map(|u| (u.category, (u.fill_pct, u.state)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltsort_traits::BoxError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone)]
    struct SettableSensor(Arc<Mutex<Result<f32, String>>>);

    impl SettableSensor {
        fn new(d: f32) -> Self {
            Self(Arc::new(Mutex::new(Ok(d))))
        }
        fn set(&self, d: f32) {
            *self.0.lock().unwrap() = Ok(d);
        }
        fn fail(&self, msg: &str) {
            *self.0.lock().unwrap() = Err(msg.into());
        }
    }

    impl LevelSensor for SettableSensor {
        fn measure(&mut self, _timeout: Duration) -> Result<f32, BoxError> {
            self.0.lock().unwrap().clone().map_err(Into::into)
        }
    }

    fn cfg() -> BinCfg {
        BinCfg {
            warn_pct: 70.0,
            full_pct: 85.0,
            crit_pct: 95.0,
            smoothing_samples: 1,
            poll_interval: Duration::from_secs(5),
            measure_timeout: Duration::from_millis(10),
        }
    }

    /// empty=1.0 m, full=0.0 m: distance 0.15 => 85% fill.
    fn monitor_with(sensor: SettableSensor) -> BinMonitor {
        let mut m = BinMonitor::new(cfg());
        m.add_bin(Category::Glass, Box::new(sensor), 1.0, 0.0);
        m
    }

    #[test]
    fn exact_full_threshold_is_full() {
        let sensor = SettableSensor::new(0.15); // 85%
        let mut m = monitor_with(sensor);
        let (changes, errors) = m.poll(Instant::now());
        assert!(errors.is_empty());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, BinState::Full);
        assert!(!m.accepting(Category::Glass));
    }

    #[test]
    fn full_clears_only_below_warn_minus_five() {
        let sensor = SettableSensor::new(0.10); // 90%
        let mut m = monitor_with(sensor.clone());
        let t = Instant::now();
        m.poll(t);
        assert!(!m.accepting(Category::Glass));

        // 75% is under full but inside the hysteresis band; still gated.
        sensor.set(0.25);
        let (changes, _) = m.poll(t + Duration::from_secs(5));
        assert!(changes.is_empty());
        assert!(!m.accepting(Category::Glass));

        // 60% < warn - 5: gate releases.
        sensor.set(0.40);
        let (changes, _) = m.poll(t + Duration::from_secs(10));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, BinState::Ok);
        assert!(m.accepting(Category::Glass));
    }

    #[test]
    fn degraded_sensor_does_not_gate() {
        let sensor = SettableSensor::new(0.05); // 95% critical
        let mut m = monitor_with(sensor.clone());
        let t = Instant::now();
        m.poll(t);
        assert!(!m.accepting(Category::Glass));

        sensor.fail("echo timeout");
        let (_, errors) = m.poll(t + Duration::from_secs(5));
        assert_eq!(errors.len(), 1);
        assert!(m.accepting(Category::Glass), "degraded bin must not block");
    }

    #[test]
    fn smoothing_averages_readings() {
        let sensor = SettableSensor::new(1.0);
        let mut m = BinMonitor::new(BinCfg {
            smoothing_samples: 2,
            ..cfg()
        });
        m.add_bin(Category::Metal, Box::new(sensor.clone()), 1.0, 0.0);
        let t = Instant::now();
        m.poll(t);
        sensor.set(0.0); // avg of [1.0, 0.0] => 0.5 => 50%
        m.poll(t + Duration::from_secs(5));
        let (fill, state) = m.states()[&Category::Metal];
        assert!((fill - 50.0).abs() < 0.01);
        assert_eq!(state, BinState::Ok);
    }

    #[test]
    fn unknown_category_is_accepting() {
        let m = BinMonitor::new(cfg());
        assert!(m.accepting(Category::Carton));
    }
}
