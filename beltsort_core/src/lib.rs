#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Real-time orchestration core for the beltsort sorter (hardware-agnostic).
//!
//! This crate turns asynchronous trigger events into precisely timed
//! diverter pulses while keeping the machine safe and live under faults.
//! All hardware interactions go through `beltsort_traits`; everything here
//! is driven by `Orchestrator::tick`, so the timing behavior can be
//! asserted deterministically with a virtual clock.
//!
//! ## Architecture
//!
//! - **Dispatch scheduler** (`scheduler`): travel-time math, the pending-fire
//!   heap, congestion serialization, cancellation generations
//! - **Diverter pool** (`diverter`): one worker thread per diverter, single
//!   in-flight activation enforced structurally
//! - **State machine** (`state`): sanctioned transitions plus the safety
//!   force-queue drained before all other work
//! - **Safety** (`safety`): debounced E-stop latch, operational-limits
//!   watchdog with hysteresis
//! - **Recovery** (`recovery`): per-(kind, component) strategy ladders with
//!   cooldowns and a global attempt budget
//! - **Telemetry** (`bus`): non-blocking topic pub/sub with per-subscriber
//!   overflow policy
//! - **Orchestrator** (`orchestrator`): wiring, lifecycle, control API,
//!   hot-swappable configuration snapshot

pub mod belt;
pub mod bins;
pub mod bus;
pub mod classify;
pub mod config;
pub mod diverter;
pub mod error;
pub mod fault;
pub mod hw_error;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod safety;
pub mod scheduler;
pub mod sensors;
pub mod state;

pub use belt::{BeltController, BeltState};
pub use bins::{BinMonitor, BinState};
pub use bus::{Event, OverflowPolicy, Subscription, TelemetryBus, Topic};
pub use classify::{Classification, ClassifierClient};
pub use config::{
    BeltCfg, BinCfg, CategoryRoute, ClassifyCfg, LimitsCfg, RecoveryCfg, ScheduleCfg, Snapshot,
};
pub use diverter::{DiverterPool, DiverterStatus};
pub use error::{BuildError, DropReason, Report, Result, SorterError};
pub use fault::{Fault, FaultKind, Severity};
pub use metrics::{Counters, MetricsRing, MetricsSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StatusReport};
pub use recovery::{FaultSummary, RecoveryAction, RecoverySupervisor};
pub use runner::{SorterHandle, SorterRuntime};
pub use safety::{EstopMonitor, HostReadings, LimitsWatchdog};
pub use scheduler::{ClassifiedItem, DispatchScheduler, Due, PendingFire, ScheduleOutcome};
pub use sensors::{TriggerEvent, TriggerListener};
pub use state::{StateMachine, SystemState, transition_allowed};
