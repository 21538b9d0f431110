//! Safety supervisor: E-stop latch and operational-limits watchdog.
//!
//! Highest-priority subsystem. It never mutates system state directly; it
//! asks the state machine for a forced transition, which the orchestrator
//! drains before any other work.

use std::time::Duration;

use beltsort_traits::SystemProbe;

use crate::config::LimitsCfg;

/// Debounced E-stop input, polled each tick. Latches on `debounce_n`
/// consecutive asserted samples and stays latched until cleared by the
/// operator acknowledgement path.
pub struct EstopMonitor {
    check: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    debounce_n: u8,
    count: u8,
    latched: bool,
}

impl EstopMonitor {
    pub fn new(check: Option<Box<dyn Fn() -> bool + Send + Sync>>, debounce_n: u8) -> Self {
        Self {
            check,
            debounce_n: debounce_n.max(1),
            count: 0,
            latched: false,
        }
    }

    /// Sample the input. Returns true exactly once, on the poll that latches.
    pub fn poll(&mut self) -> bool {
        if self.latched {
            return false;
        }
        let Some(check) = &self.check else {
            return false;
        };
        if check() {
            self.count = self.count.saturating_add(1);
            if self.count >= self.debounce_n {
                self.latched = true;
                return true;
            }
        } else {
            self.count = 0;
        }
        false
    }

    pub fn latched(&self) -> bool {
        self.latched
    }

    /// True while the physical input still reads asserted.
    pub fn asserted(&self) -> bool {
        self.check.as_ref().map(|c| c()).unwrap_or(false)
    }

    /// Operator acknowledgement; requires the input to be released.
    pub fn clear(&mut self) -> bool {
        if self.asserted() {
            return false;
        }
        self.latched = false;
        self.count = 0;
        true
    }
}

/// Which operational limit tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Cpu,
    Memory,
    Temperature,
    Runtime,
    Throughput,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Cpu => "cpu",
            LimitKind::Memory => "memory",
            LimitKind::Temperature => "temperature",
            LimitKind::Runtime => "runtime",
            LimitKind::Throughput => "throughput",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLevel {
    Warn,
    Critical,
}

#[derive(Debug, Clone)]
pub enum LimitEvent {
    Breached {
        kind: LimitKind,
        level: LimitLevel,
        value: f32,
        message: String,
    },
    /// A previous breach cleared after the hysteresis requirement.
    Cleared { kind: LimitKind },
}

/// Latest host readings, surfaced into metrics as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostReadings {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub temp_c: f32,
}

struct Breach {
    kind: LimitKind,
    level: LimitLevel,
    threshold: f32,
    clear_streak: u32,
}

/// Samples host health and run counters against configured limits.
/// Hysteresis: a breach clears only after the value stays below
/// threshold - clear_margin for clear_samples consecutive samples.
pub struct LimitsWatchdog {
    probe: Box<dyn SystemProbe + Send>,
    cfg: LimitsCfg,
    breaches: Vec<Breach>,
    readings: HostReadings,
}

impl LimitsWatchdog {
    pub fn new(probe: Box<dyn SystemProbe + Send>, cfg: LimitsCfg) -> Self {
        Self {
            probe,
            cfg,
            breaches: Vec::new(),
            readings: HostReadings::default(),
        }
    }

    pub fn set_cfg(&mut self, cfg: LimitsCfg) {
        self.cfg = cfg;
    }

    pub fn readings(&self) -> HostReadings {
        self.readings
    }

    /// One watchdog pass. `runtime` is continuous time in `running`;
    /// `items_last_hour` the recent throughput estimate.
    pub fn sample(&mut self, runtime: Duration, items_last_hour: u32) -> Vec<LimitEvent> {
        let cpu = self.probe.cpu_percent().unwrap_or(0.0);
        let mem = self.probe.memory_percent().unwrap_or(0.0);
        let temp = self.probe.temperature_c().unwrap_or(0.0);
        self.readings = HostReadings {
            cpu_pct: cpu,
            mem_pct: mem,
            temp_c: temp,
        };

        let mut events = Vec::new();
        let checks = [
            (LimitKind::Cpu, cpu, self.cfg.cpu_warn_pct, self.cfg.cpu_crit_pct, "%"),
            (LimitKind::Memory, mem, self.cfg.mem_warn_pct, self.cfg.mem_crit_pct, "%"),
            (LimitKind::Temperature, temp, self.cfg.temp_warn_c, self.cfg.temp_crit_c, "°C"),
            (
                LimitKind::Runtime,
                runtime.as_secs_f32() / 3600.0,
                self.cfg.max_runtime.as_secs_f32() / 3600.0,
                f32::INFINITY,
                "h",
            ),
            (
                LimitKind::Throughput,
                items_last_hour as f32,
                self.cfg.max_items_per_hour as f32,
                f32::INFINITY,
                " items/h",
            ),
        ];

        for (kind, value, warn, crit, unit) in checks {
            let clear_margin = self.cfg.clear_margin;
            let clear_samples = self.cfg.clear_samples;
            if let Some(i) = self.breaches.iter().position(|b| b.kind == kind) {
                let cleared = {
                    let breach = &mut self.breaches[i];
                    if value < breach.threshold - clear_margin {
                        breach.clear_streak += 1;
                        breach.clear_streak >= clear_samples
                    } else {
                        breach.clear_streak = 0;
                        // A warn-level breach may escalate while active.
                        if breach.level == LimitLevel::Warn && value >= crit {
                            breach.level = LimitLevel::Critical;
                            breach.threshold = crit;
                            events.push(LimitEvent::Breached {
                                kind,
                                level: LimitLevel::Critical,
                                value,
                                message: format!("{} at {value:.1}{unit}", kind.as_str()),
                            });
                        }
                        false
                    }
                };
                if cleared {
                    self.breaches.remove(i);
                    events.push(LimitEvent::Cleared { kind });
                }
            } else {
                let level = if value >= crit {
                    Some((LimitLevel::Critical, crit))
                } else if value >= warn {
                    Some((LimitLevel::Warn, warn))
                } else {
                    None
                };
                if let Some((level, threshold)) = level {
                    self.breaches.push(Breach {
                        kind,
                        level,
                        threshold,
                        clear_streak: 0,
                    });
                    events.push(LimitEvent::Breached {
                        kind,
                        level,
                        value,
                        message: format!("{} at {value:.1}{unit}", kind.as_str()),
                    });
                }
            }
        }
        events
    }
}
