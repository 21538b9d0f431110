//! Core-level configuration snapshot.
//!
//! These are the fields core behavior depends on, already converted to
//! typed durations and categories. The CLI maps the file-level
//! `beltsort_config::Config` into a [`Snapshot`]; the orchestrator hands it
//! out behind an `Arc` and swaps the whole thing on hot reload. Consumers
//! never mutate it.

use std::collections::HashMap;
use std::time::Duration;

use beltsort_traits::Category;

/// Per-category routing: where the diverter sits and how it pulses.
#[derive(Debug, Clone)]
pub struct CategoryRoute {
    pub distance_m: f64,
    /// How long the diverter pulse holds.
    pub activation: Duration,
    /// Actuator startup compensation subtracted from the computed fire time.
    pub lead: Duration,
    /// Maintenance ceiling; crossing it raises a fault but keeps operating.
    pub max_operations: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScheduleCfg {
    pub simultaneous_activations: bool,
    /// Minimum spacing enforced between serialized activations.
    pub min_gap: Duration,
    /// Jitter tolerance around scheduled fire times.
    pub grace: Duration,
    /// On pause, fires further out than now + pause_grace are cancelled.
    pub pause_grace: Duration,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            simultaneous_activations: false,
            min_gap: Duration::from_millis(200),
            grace: Duration::from_millis(50),
            pause_grace: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyCfg {
    pub min_confidence: f32,
    pub fallback: Category,
    /// Model alias -> canonical category.
    pub aliases: HashMap<String, Category>,
    /// Per-call inference budget.
    pub budget: Duration,
}

impl Default for ClassifyCfg {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            fallback: Category::Other,
            aliases: HashMap::new(),
            budget: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeltCfg {
    /// Nominal transport speed when running.
    pub nominal_mps: f64,
    pub min_duty: f32,
    pub max_duty: f32,
    pub accel: Duration,
    pub decel: Duration,
}

impl Default for BeltCfg {
    fn default() -> Self {
        Self {
            nominal_mps: 0.15,
            min_duty: 20.0,
            max_duty: 100.0,
            accel: Duration::from_secs(1),
            decel: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitsCfg {
    pub cpu_warn_pct: f32,
    pub cpu_crit_pct: f32,
    pub mem_warn_pct: f32,
    pub mem_crit_pct: f32,
    pub temp_warn_c: f32,
    pub temp_crit_c: f32,
    pub max_runtime: Duration,
    pub max_items_per_hour: u32,
    /// Pipeline error-rate fraction that raises a warning alert.
    pub error_rate_warn: f32,
    /// Hysteresis: breach clears after staying below threshold - margin
    /// for `clear_samples` consecutive samples.
    pub clear_margin: f32,
    pub clear_samples: u32,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            cpu_warn_pct: 80.0,
            cpu_crit_pct: 95.0,
            mem_warn_pct: 85.0,
            mem_crit_pct: 95.0,
            temp_warn_c: 70.0,
            temp_crit_c: 80.0,
            max_runtime: Duration::from_secs(12 * 3600),
            max_items_per_hour: 3600,
            error_rate_warn: 0.25,
            clear_margin: 5.0,
            clear_samples: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryCfg {
    pub enabled: bool,
    /// Per-(kind, component) consecutive-failure ceiling before escalating
    /// to the next rung of the strategy ladder.
    pub max_consecutive: u32,
    /// Cooldown between attempts on the same record.
    pub cooldown: Duration,
    /// Global attempt budget across all kinds within `budget_window`.
    pub global_budget: u32,
    pub budget_window: Duration,
    pub auto_disable_on_fault: bool,
}

impl Default for RecoveryCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            max_consecutive: 3,
            cooldown: Duration::from_secs(30),
            global_budget: 5,
            budget_window: Duration::from_secs(60),
            auto_disable_on_fault: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinCfg {
    pub warn_pct: f32,
    pub full_pct: f32,
    pub crit_pct: f32,
    pub smoothing_samples: usize,
    pub poll_interval: Duration,
    pub measure_timeout: Duration,
}

impl Default for BinCfg {
    fn default() -> Self {
        Self {
            warn_pct: 70.0,
            full_pct: 85.0,
            crit_pct: 95.0,
            smoothing_samples: 5,
            poll_interval: Duration::from_secs(5),
            measure_timeout: Duration::from_millis(50),
        }
    }
}

/// Immutable configuration view used by the orchestration core.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub routes: HashMap<Category, CategoryRoute>,
    pub schedule: ScheduleCfg,
    pub classify: ClassifyCfg,
    pub belt: BeltCfg,
    pub limits: LimitsCfg,
    pub recovery: RecoveryCfg,
    pub bins: BinCfg,
    pub metrics_interval: Duration,
    pub metrics_history: usize,
    pub maintenance_timeout: Duration,
    /// Consecutive hot-path error budget before a fault is raised.
    pub max_processing_errors: u32,
    pub shutdown_drain: Duration,
    pub estop_debounce_n: u8,
    pub trigger_debounce: Duration,
    pub tick: Duration,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            schedule: ScheduleCfg::default(),
            classify: ClassifyCfg::default(),
            belt: BeltCfg::default(),
            limits: LimitsCfg::default(),
            recovery: RecoveryCfg::default(),
            bins: BinCfg::default(),
            metrics_interval: Duration::from_secs(5),
            metrics_history: 720,
            maintenance_timeout: Duration::from_secs(1800),
            max_processing_errors: 10,
            shutdown_drain: Duration::from_secs(5),
            estop_debounce_n: 2,
            trigger_debounce: Duration::from_millis(50),
            tick: Duration::from_millis(10),
        }
    }
}
