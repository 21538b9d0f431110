//! Fault taxonomy shared by the safety and recovery supervisors.
//!
//! Local components report faults; they never retry on their own. The
//! recovery supervisor is the single authority that decides what happens
//! next, which is what makes the retry budget enforceable globally.

use std::time::Instant;

/// Closed set of fault kinds. Extensible only by code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    CameraFailure,
    AiModelFailure,
    HardwareFailure,
    SensorFailure,
    BeltFailure,
    BinFull,
    MemoryLeak,
    HighTemperature,
    EStop,
    ConfigInvalid,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::CameraFailure => "camera_failure",
            FaultKind::AiModelFailure => "ai_model_failure",
            FaultKind::HardwareFailure => "hardware_failure",
            FaultKind::SensorFailure => "sensor_failure",
            FaultKind::BeltFailure => "belt_failure",
            FaultKind::BinFull => "bin_full",
            FaultKind::MemoryLeak => "memory_leak",
            FaultKind::HighTemperature => "high_temperature",
            FaultKind::EStop => "e_stop",
            FaultKind::ConfigInvalid => "config_invalid",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reported fault. Coalescing per (kind, component) happens inside the
/// recovery supervisor's records, not here.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub component: String,
    pub severity: Severity,
    pub message: String,
    pub at: Instant,
}

impl Fault {
    pub fn new(
        kind: FaultKind,
        component: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        at: Instant,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            severity,
            message: message.into(),
            at,
        }
    }
}
