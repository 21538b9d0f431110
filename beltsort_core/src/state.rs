//! System state machine: legal transitions, forced-transition priority queue.
//!
//! The machine is the single writer of the system state. Other subsystems
//! (safety above all) request pre-emption by posting a [`ForcedTransition`];
//! the orchestrator drains those before doing any other work in a tick, so a
//! safety demand is never reordered behind pipeline activity.

use std::collections::VecDeque;
use std::time::Instant;

use crate::error::SorterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Initializing,
    Idle,
    Running,
    Paused,
    Maintenance,
    Error,
    Recovering,
    ShuttingDown,
    Shutdown,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Initializing => "initializing",
            SystemState::Idle => "idle",
            SystemState::Running => "running",
            SystemState::Paused => "paused",
            SystemState::Maintenance => "maintenance",
            SystemState::Error => "error",
            SystemState::Recovering => "recovering",
            SystemState::ShuttingDown => "shutting_down",
            SystemState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Is `from -> to` on the sanctioned transition graph?
pub fn transition_allowed(from: SystemState, to: SystemState) -> bool {
    use SystemState::*;
    match from {
        Initializing => matches!(to, Idle | Error),
        Idle => matches!(to, Running | Maintenance | ShuttingDown | Error),
        Running => matches!(to, Paused | Maintenance | Error | Recovering | ShuttingDown),
        Paused => matches!(to, Running | Maintenance | Error | ShuttingDown),
        Maintenance => matches!(to, Idle | ShuttingDown),
        Error => matches!(to, Recovering | ShuttingDown),
        Recovering => matches!(to, Idle | Running | Error | ShuttingDown),
        ShuttingDown => matches!(to, Shutdown),
        Shutdown => false,
    }
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: SystemState,
    pub to: SystemState,
    pub reason: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct ForcedTransition {
    pub target: SystemState,
    pub reason: String,
}

#[derive(Debug)]
pub struct StateMachine {
    current: SystemState,
    entered_at: Instant,
    last_reason: String,
    forced: VecDeque<ForcedTransition>,
}

impl StateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            current: SystemState::Initializing,
            entered_at: now,
            last_reason: "boot".into(),
            forced: VecDeque::new(),
        }
    }

    pub fn current(&self) -> SystemState {
        self.current
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn last_reason(&self) -> &str {
        &self.last_reason
    }

    /// Attempt a sanctioned transition. Fails if the edge is not on the graph.
    pub fn transition(
        &mut self,
        to: SystemState,
        reason: impl Into<String>,
        now: Instant,
    ) -> Result<StateChange, SorterError> {
        if !transition_allowed(self.current, to) {
            return Err(SorterError::State(format!(
                "illegal transition {} -> {}",
                self.current, to
            )));
        }
        Ok(self.apply(to, reason.into(), now))
    }

    /// Queue a pre-emptive transition. Drained before any other work.
    pub fn force(&mut self, target: SystemState, reason: impl Into<String>) {
        self.forced.push_back(ForcedTransition {
            target,
            reason: reason.into(),
        });
    }

    pub fn has_forced(&self) -> bool {
        !self.forced.is_empty()
    }

    /// Apply all queued forced transitions in order. Forced demands for
    /// `Error` and `ShuttingDown` are safety-privileged and bypass the graph;
    /// anything else still has to be a legal edge (illegal ones are dropped
    /// with a warning rather than corrupting the walk).
    pub fn drain_forced(&mut self, now: Instant) -> Vec<StateChange> {
        let mut out = Vec::new();
        while let Some(f) = self.forced.pop_front() {
            if f.target == self.current {
                continue;
            }
            let privileged =
                matches!(f.target, SystemState::Error | SystemState::ShuttingDown);
            if privileged || transition_allowed(self.current, f.target) {
                out.push(self.apply(f.target, f.reason, now));
            } else {
                tracing::warn!(
                    from = %self.current,
                    target = %f.target,
                    reason = %f.reason,
                    "dropping forced transition off the graph"
                );
            }
        }
        out
    }

    fn apply(&mut self, to: SystemState, reason: String, now: Instant) -> StateChange {
        let change = StateChange {
            from: self.current,
            to,
            reason: reason.clone(),
            at: now,
        };
        tracing::info!(from = %change.from, to = %change.to, reason = %reason, "state change");
        self.current = to;
        self.entered_at = now;
        self.last_reason = reason;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SystemState::*;

    #[test]
    fn shutdown_is_terminal() {
        for to in [
            Initializing,
            Idle,
            Running,
            Paused,
            Maintenance,
            Error,
            Recovering,
            ShuttingDown,
        ] {
            assert!(!transition_allowed(Shutdown, to));
        }
    }

    #[test]
    fn maintenance_only_from_idle_paused_or_running() {
        assert!(transition_allowed(Idle, Maintenance));
        assert!(transition_allowed(Paused, Maintenance));
        assert!(transition_allowed(Running, Maintenance));
        assert!(!transition_allowed(Error, Maintenance));
        assert!(!transition_allowed(Recovering, Maintenance));
    }

    #[test]
    fn rejects_illegal_edges() {
        let now = Instant::now();
        let mut sm = StateMachine::new(now);
        assert!(sm.transition(Running, "skip idle", now).is_err());
        sm.transition(Idle, "init done", now).unwrap();
        sm.transition(Running, "start", now).unwrap();
        assert_eq!(sm.current(), Running);
    }

    #[test]
    fn forced_error_bypasses_graph_from_maintenance() {
        let now = Instant::now();
        let mut sm = StateMachine::new(now);
        sm.transition(Idle, "init done", now).unwrap();
        sm.transition(Maintenance, "service", now).unwrap();
        // maintenance -> error is not a sanctioned edge, but safety may force it
        sm.force(Error, "E_STOP");
        let changes = sm.drain_forced(now);
        assert_eq!(changes.len(), 1);
        assert_eq!(sm.current(), Error);
    }

    #[test]
    fn forced_nonprivileged_respects_graph() {
        let now = Instant::now();
        let mut sm = StateMachine::new(now);
        sm.transition(Idle, "init done", now).unwrap();
        sm.force(Paused, "limits");
        // idle -> paused is off the graph; the demand is dropped
        assert!(sm.drain_forced(now).is_empty());
        assert_eq!(sm.current(), Idle);
    }
}
