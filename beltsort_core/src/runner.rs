//! Threaded runner: drives `Orchestrator::tick` on a real clock and exposes
//! a cloneable control handle. The orchestrator itself stays synchronous so
//! tests can drive it with a virtual clock instead.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use beltsort_traits::Clock;
use crossbeam_channel as xch;

use crate::config::Snapshot;
use crate::error::{Result, SorterError};
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::{Orchestrator, StatusReport};
use crate::state::SystemState;

enum Command {
    Start(xch::Sender<Result<SystemState>>),
    Stop(xch::Sender<Result<SystemState>>),
    Pause(xch::Sender<Result<SystemState>>),
    Resume(xch::Sender<Result<SystemState>>),
    EmergencyStop(xch::Sender<SystemState>),
    EnterMaintenance(xch::Sender<Result<SystemState>>),
    ExitMaintenance(xch::Sender<Result<SystemState>>),
    Acknowledge(xch::Sender<Result<SystemState>>),
    Reload(Arc<Snapshot>),
    Status(xch::Sender<StatusReport>),
    Metrics(usize, xch::Sender<Vec<MetricsSnapshot>>),
}

/// Cloneable control surface for a running orchestrator thread.
#[derive(Clone)]
pub struct SorterHandle {
    tx: xch::Sender<Command>,
}

macro_rules! request {
    ($self:ident, $variant:ident) => {{
        let (tx, rx) = xch::bounded(1);
        $self
            .tx
            .send(Command::$variant(tx))
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))?;
        rx.recv()
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))?
    }};
}

impl SorterHandle {
    pub fn start(&self) -> Result<SystemState> {
        request!(self, Start)
    }

    pub fn stop(&self) -> Result<SystemState> {
        request!(self, Stop)
    }

    pub fn pause(&self) -> Result<SystemState> {
        request!(self, Pause)
    }

    pub fn resume(&self) -> Result<SystemState> {
        request!(self, Resume)
    }

    pub fn emergency_stop(&self) -> Result<SystemState> {
        let (tx, rx) = xch::bounded(1);
        self.tx
            .send(Command::EmergencyStop(tx))
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))?;
        rx.recv()
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))
            .map_err(Into::into)
    }

    pub fn enter_maintenance(&self) -> Result<SystemState> {
        request!(self, EnterMaintenance)
    }

    pub fn exit_maintenance(&self) -> Result<SystemState> {
        request!(self, ExitMaintenance)
    }

    pub fn acknowledge(&self) -> Result<SystemState> {
        request!(self, Acknowledge)
    }

    pub fn reload(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        self.tx
            .send(Command::Reload(snapshot))
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))
    }

    pub fn status(&self) -> Result<StatusReport> {
        let (tx, rx) = xch::bounded(1);
        self.tx
            .send(Command::Status(tx))
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))?;
        rx.recv()
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))
            .map_err(Into::into)
    }

    pub fn metrics(&self, window: usize) -> Result<Vec<MetricsSnapshot>> {
        let (tx, rx) = xch::bounded(1);
        self.tx
            .send(Command::Metrics(window, tx))
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))?;
        rx.recv()
            .map_err(|_| eyre::Report::new(SorterError::State("orchestrator stopped".into())))
            .map_err(Into::into)
    }
}

pub struct SorterRuntime {
    handle: SorterHandle,
    join: Option<JoinHandle<()>>,
}

impl SorterRuntime {
    /// Move the orchestrator onto its own thread and return the handle pair.
    pub fn spawn(mut orchestrator: Orchestrator, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let (tx, rx) = xch::unbounded::<Command>();

        let join = std::thread::spawn(move || {
            loop {
                // Control first, then a tick, then sleep toward whichever
                // comes sooner: the next tick or the next scheduled fire.
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        Command::Start(reply) => {
                            let _ = reply.send(orchestrator.start());
                        }
                        Command::Stop(reply) => {
                            let _ = reply.send(orchestrator.stop());
                        }
                        Command::Pause(reply) => {
                            let _ = reply.send(orchestrator.pause("operator pause"));
                        }
                        Command::Resume(reply) => {
                            let _ = reply.send(orchestrator.resume());
                        }
                        Command::EmergencyStop(reply) => {
                            let _ = reply.send(orchestrator.emergency_stop());
                        }
                        Command::EnterMaintenance(reply) => {
                            let _ = reply.send(orchestrator.enter_maintenance());
                        }
                        Command::ExitMaintenance(reply) => {
                            let _ = reply.send(orchestrator.exit_maintenance());
                        }
                        Command::Acknowledge(reply) => {
                            let _ = reply.send(orchestrator.acknowledge());
                        }
                        Command::Reload(snapshot) => orchestrator.reload(snapshot),
                        Command::Status(reply) => {
                            let _ = reply.send(orchestrator.status());
                        }
                        Command::Metrics(window, reply) => {
                            let _ = reply.send(orchestrator.metrics_window(window));
                        }
                    }
                }

                if let Err(e) = orchestrator.tick() {
                    tracing::error!(error = %e, "orchestrator tick failed");
                }

                if orchestrator.state() == SystemState::Shutdown {
                    tracing::info!("orchestrator reached shutdown");
                    break;
                }

                let now = clock.now();
                let tick = orchestrator.tick_period();
                let sleep = match orchestrator.next_deadline() {
                    Some(deadline) if deadline > now => {
                        tick.min(deadline.saturating_duration_since(now))
                    }
                    Some(_) => Duration::from_millis(1),
                    None => tick,
                };
                clock.sleep(sleep);
            }
        });

        Self {
            handle: SorterHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> SorterHandle {
        self.handle.clone()
    }

    /// Block until the orchestrator thread exits (after `stop()`), bounded
    /// by `timeout`.
    pub fn join(mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if let Some(join) = self.join.take() {
            while !join.is_finished() {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            let _ = join.join();
        }
        true
    }
}
