//! Recovery supervisor: the only authority allowed to retry.
//!
//! Components report faults and carry on; this supervisor keeps the
//! per-(kind, component) records, applies the strategy ladder for the kind,
//! enforces cooldowns, and escalates when budgets run out. A global attempt
//! budget over a rolling window caps automatic recovery across all kinds, so
//! a miswired cooldown can never loop forever.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::config::RecoveryCfg;
use crate::fault::{Fault, FaultKind};

/// What the orchestrator should do about a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try the same component again.
    Retry,
    /// Tear the component down and reinitialize it.
    Restart,
    /// Switch to the configured backup (camera index, model path).
    Failover,
    /// Take the component out of service and keep running without it.
    Disable,
    /// Pause operation until the condition clears (thermal, memory).
    Pause,
    /// Stop automatic handling; state machine goes to error.
    Escalate,
    /// Cooldown active or recovery disabled; coalesce and do nothing now.
    Defer,
    /// Not recoverable by design (bin full, config rejected).
    None,
}

#[derive(Debug)]
struct FaultRecord {
    count: u64,
    consecutive: u32,
    first_at: Instant,
    last_at: Instant,
    last_attempt_at: Option<Instant>,
    /// Rungs already exhausted on the ladder for this record.
    rung: u32,
}

pub struct RecoverySupervisor {
    cfg: RecoveryCfg,
    records: HashMap<(FaultKind, String), FaultRecord>,
    /// Recent attempt instants, pruned to the budget window.
    attempts: VecDeque<Instant>,
    /// True once the global budget tripped; stays escalated until reset.
    exhausted: bool,
}

impl RecoverySupervisor {
    pub fn new(cfg: RecoveryCfg) -> Self {
        Self {
            cfg,
            records: HashMap::new(),
            attempts: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn set_cfg(&mut self, cfg: RecoveryCfg) {
        self.cfg = cfg;
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Forget consecutive-failure history for a component after a confirmed
    /// recovery.
    pub fn on_recovered(&mut self, kind: FaultKind, component: &str) {
        if let Some(rec) = self.records.get_mut(&(kind, component.to_string())) {
            rec.consecutive = 0;
            rec.rung = 0;
        }
    }

    /// Full reset (operator acknowledged an escalation).
    pub fn reset(&mut self) {
        self.records.clear();
        self.attempts.clear();
        self.exhausted = false;
    }

    /// Decide the next action for a reported fault.
    pub fn on_fault(&mut self, fault: &Fault, now: Instant) -> RecoveryAction {
        // Kinds that are never auto-recovered, regardless of budgets.
        match fault.kind {
            FaultKind::EStop => return RecoveryAction::Escalate,
            FaultKind::BeltFailure => return RecoveryAction::Escalate,
            FaultKind::BinFull | FaultKind::ConfigInvalid => return RecoveryAction::None,
            _ => {}
        }

        if !self.cfg.enabled {
            return RecoveryAction::Escalate;
        }
        if self.exhausted {
            return RecoveryAction::Defer;
        }

        let key = (fault.kind, fault.component.clone());
        let action = {
            let cooldown = self.cfg.cooldown;
            let max_consecutive = self.cfg.max_consecutive;
            let auto_disable = self.cfg.auto_disable_on_fault;
            let rec = self.records.entry(key.clone()).or_insert(FaultRecord {
                count: 0,
                consecutive: 0,
                first_at: now,
                last_at: now,
                last_attempt_at: None,
                rung: 0,
            });
            rec.count += 1;
            rec.last_at = now;

            // Coalesce while a cooldown is active; coalesced faults don't
            // count against the consecutive-attempt ceiling.
            if let Some(last) = rec.last_attempt_at
                && now.saturating_duration_since(last) < cooldown
            {
                tracing::debug!(
                    kind = %fault.kind,
                    component = %fault.component,
                    "fault coalesced during cooldown"
                );
                return RecoveryAction::Defer;
            }
            rec.consecutive += 1;

            // Exhausting the per-record ceiling moves to the next rung.
            if rec.consecutive > max_consecutive {
                rec.rung += 1;
                rec.consecutive = 1;
            }

            ladder(fault.kind, rec.rung, auto_disable)
        };
        if action == RecoveryAction::Escalate {
            return RecoveryAction::Escalate;
        }

        // Global budget check: every actionable attempt spends from it.
        self.prune_attempts(now);
        if self.attempts.len() as u32 >= self.cfg.global_budget {
            tracing::error!(
                budget = self.cfg.global_budget,
                window_s = self.cfg.budget_window.as_secs(),
                "global recovery budget exhausted, escalating"
            );
            self.exhausted = true;
            return RecoveryAction::Escalate;
        }
        self.attempts.push_back(now);
        if let Some(rec) = self.records.get_mut(&key) {
            rec.last_attempt_at = Some(now);
        }
        action
    }

    fn prune_attempts(&mut self, now: Instant) {
        while let Some(front) = self.attempts.front() {
            if now.saturating_duration_since(*front) > self.cfg.budget_window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_summary(&self) -> Vec<FaultSummary> {
        self.records
            .iter()
            .map(|((k, c), r)| FaultSummary {
                kind: *k,
                component: c.clone(),
                count: r.count,
                first_at: r.first_at,
                last_at: r.last_at,
            })
            .collect()
    }
}

/// Coalesced view of one (kind, component) record for status reporting.
#[derive(Debug, Clone)]
pub struct FaultSummary {
    pub kind: FaultKind,
    pub component: String,
    pub count: u64,
    pub first_at: Instant,
    pub last_at: Instant,
}

/// Per-kind strategy ladder: which action each escalation rung maps to.
fn ladder(kind: FaultKind, rung: u32, auto_disable: bool) -> RecoveryAction {
    use FaultKind::*;
    use RecoveryAction::*;
    match kind {
        CameraFailure => match rung {
            0 => Failover,
            1 => Retry,
            _ => Escalate,
        },
        AiModelFailure => match rung {
            0 => Restart,
            1 => Failover,
            _ => Escalate,
        },
        HardwareFailure => match rung {
            0 => Retry,
            1 if auto_disable => Disable,
            _ => Escalate,
        },
        SensorFailure => match rung {
            0 => Disable,
            1 => Retry,
            _ => Escalate,
        },
        MemoryLeak => match rung {
            0 => Restart,
            _ => Pause,
        },
        HighTemperature => Pause,
        // Handled above; kept exhaustive for the compiler.
        EStop | BeltFailure => Escalate,
        BinFull | ConfigInvalid => None,
    }
}
