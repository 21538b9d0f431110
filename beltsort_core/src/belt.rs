//! Conveyor belt controller: ramped start/stop over a raw PWM drive.
//!
//! The scheduler treats speed as instantaneous at the nominal value while the
//! controller reports `Running`; during ramps `nominal_speed_mps()` is zero
//! and no new fires are scheduled.

use std::time::Instant;

use beltsort_traits::BeltDrive;

use crate::config::BeltCfg;
use crate::error::{Result, SorterError};
use crate::hw_error::map_hw_error;
use eyre::WrapErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeltState {
    Stopped,
    Accelerating,
    Running,
    Decelerating,
    EmergencyStop,
}

impl BeltState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeltState::Stopped => "stopped",
            BeltState::Accelerating => "accelerating",
            BeltState::Running => "running",
            BeltState::Decelerating => "decelerating",
            BeltState::EmergencyStop => "emergency_stop",
        }
    }
}

pub struct BeltController {
    drive: Box<dyn BeltDrive + Send>,
    cfg: BeltCfg,
    state: BeltState,
    target_mps: f64,
    /// Speed remembered across a pause so Resume restores it.
    resume_mps: f64,
    ramp_started: Option<Instant>,
    ramp_from_duty: f32,
    ramp_to_duty: f32,
    current_duty: f32,
}

impl BeltController {
    pub fn new(drive: Box<dyn BeltDrive + Send>, cfg: BeltCfg) -> Self {
        Self {
            drive,
            cfg,
            state: BeltState::Stopped,
            target_mps: 0.0,
            resume_mps: 0.0,
            ramp_started: None,
            ramp_from_duty: 0.0,
            ramp_to_duty: 0.0,
            current_duty: 0.0,
        }
    }

    pub fn state(&self) -> BeltState {
        self.state
    }

    /// Speed the scheduler should plan with: the nominal target while
    /// running, zero otherwise.
    pub fn nominal_speed_mps(&self) -> f64 {
        if self.state == BeltState::Running {
            self.target_mps
        } else {
            0.0
        }
    }

    pub fn set_cfg(&mut self, cfg: BeltCfg) {
        self.cfg = cfg;
    }

    fn duty_for(&self, mps: f64) -> f32 {
        if mps <= 0.0 {
            return 0.0;
        }
        let frac = (mps / self.cfg.nominal_mps).clamp(0.0, 1.0) as f32;
        self.cfg.min_duty + frac * (self.cfg.max_duty - self.cfg.min_duty)
    }

    /// Begin accelerating toward `target_mps`.
    pub fn start(&mut self, target_mps: f64, now: Instant) -> Result<()> {
        if self.state == BeltState::EmergencyStop {
            return Err(eyre::Report::new(SorterError::State(
                "belt latched in emergency stop".into(),
            )));
        }
        if target_mps <= 0.0 {
            return Err(eyre::Report::new(SorterError::Config(
                "belt target speed must be > 0".into(),
            )));
        }
        self.target_mps = target_mps;
        self.resume_mps = target_mps;
        self.begin_ramp(self.duty_for(target_mps), now);
        self.state = BeltState::Accelerating;
        tracing::info!(target_mps, "belt accelerating");
        Ok(())
    }

    /// Decelerate to a stop (or cut immediately when `ramped` is false).
    pub fn stop(&mut self, ramped: bool, now: Instant) -> Result<()> {
        if self.state == BeltState::Stopped {
            return Ok(());
        }
        if ramped && self.state != BeltState::EmergencyStop {
            self.begin_ramp(0.0, now);
            self.state = BeltState::Decelerating;
        } else {
            self.apply_duty(0.0)?;
            self.state = BeltState::Stopped;
        }
        self.target_mps = 0.0;
        Ok(())
    }

    /// Ramped stop that remembers the speed for `resume`.
    pub fn pause(&mut self, now: Instant) -> Result<()> {
        if self.state == BeltState::Running || self.state == BeltState::Accelerating {
            self.resume_mps = if self.target_mps > 0.0 {
                self.target_mps
            } else {
                self.resume_mps
            };
            self.begin_ramp(0.0, now);
            self.state = BeltState::Decelerating;
            self.target_mps = 0.0;
        }
        Ok(())
    }

    pub fn resume(&mut self, now: Instant) -> Result<()> {
        let mps = if self.resume_mps > 0.0 {
            self.resume_mps
        } else {
            self.cfg.nominal_mps
        };
        self.start(mps, now)
    }

    /// Non-ramped power cut. Latches until `reset_emergency`.
    pub fn emergency_stop(&mut self) -> Result<()> {
        self.target_mps = 0.0;
        self.ramp_started = None;
        self.state = BeltState::EmergencyStop;
        self.current_duty = 0.0;
        self.drive
            .power_off()
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("belt power off")
    }

    /// Clear the emergency latch after operator acknowledgement.
    pub fn reset_emergency(&mut self) {
        if self.state == BeltState::EmergencyStop {
            self.state = BeltState::Stopped;
        }
    }

    /// Advance any in-progress ramp. Call once per orchestrator tick.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        let Some(started) = self.ramp_started else {
            return Ok(());
        };
        let ramp = match self.state {
            BeltState::Accelerating => self.cfg.accel,
            BeltState::Decelerating => self.cfg.decel,
            _ => {
                self.ramp_started = None;
                return Ok(());
            }
        };
        let elapsed = now.saturating_duration_since(started);
        let frac = if ramp.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f32() / ramp.as_secs_f32()).clamp(0.0, 1.0)
        };
        let duty = self.ramp_from_duty + (self.ramp_to_duty - self.ramp_from_duty) * frac;
        self.apply_duty(duty)?;
        if frac >= 1.0 {
            self.ramp_started = None;
            self.state = if self.ramp_to_duty > 0.0 {
                BeltState::Running
            } else {
                BeltState::Stopped
            };
            tracing::debug!(state = self.state.as_str(), duty, "belt ramp complete");
        }
        Ok(())
    }

    fn begin_ramp(&mut self, to_duty: f32, now: Instant) {
        self.ramp_from_duty = self.current_duty;
        self.ramp_to_duty = to_duty;
        self.ramp_started = Some(now);
    }

    fn apply_duty(&mut self, duty: f32) -> Result<()> {
        self.current_duty = duty;
        self.drive
            .set_duty(duty)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("belt set duty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beltsort_traits::BoxError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingDrive {
        duties: Arc<Mutex<Vec<f32>>>,
        powered_off: Arc<Mutex<bool>>,
    }

    impl BeltDrive for RecordingDrive {
        fn set_duty(&mut self, duty_pct: f32) -> std::result::Result<(), BoxError> {
            self.duties.lock().unwrap().push(duty_pct);
            Ok(())
        }
        fn power_off(&mut self) -> std::result::Result<(), BoxError> {
            *self.powered_off.lock().unwrap() = true;
            Ok(())
        }
    }

    fn controller(drive: RecordingDrive) -> BeltController {
        BeltController::new(
            Box::new(drive),
            BeltCfg {
                nominal_mps: 0.15,
                min_duty: 20.0,
                max_duty: 100.0,
                accel: Duration::from_secs(1),
                decel: Duration::from_secs(1),
            },
        )
    }

    #[test]
    fn ramps_to_running_and_reports_nominal_speed() {
        let drive = RecordingDrive::default();
        let mut belt = controller(drive.clone());
        let t0 = Instant::now();

        belt.start(0.15, t0).unwrap();
        assert_eq!(belt.state(), BeltState::Accelerating);
        assert_eq!(belt.nominal_speed_mps(), 0.0);

        belt.tick(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(belt.state(), BeltState::Accelerating);

        belt.tick(t0 + Duration::from_millis(1001)).unwrap();
        assert_eq!(belt.state(), BeltState::Running);
        assert!((belt.nominal_speed_mps() - 0.15).abs() < 1e-9);
        let last = *drive.duties.lock().unwrap().last().unwrap();
        assert!((last - 100.0).abs() < 0.5);
    }

    #[test]
    fn emergency_stop_cuts_power_and_latches() {
        let drive = RecordingDrive::default();
        let mut belt = controller(drive.clone());
        let t0 = Instant::now();
        belt.start(0.15, t0).unwrap();
        belt.emergency_stop().unwrap();
        assert_eq!(belt.state(), BeltState::EmergencyStop);
        assert!(*drive.powered_off.lock().unwrap());
        assert!(belt.start(0.15, t0).is_err());
        belt.reset_emergency();
        assert!(belt.start(0.15, t0).is_ok());
    }

    #[test]
    fn pause_then_resume_restores_speed() {
        let drive = RecordingDrive::default();
        let mut belt = controller(drive);
        let t0 = Instant::now();
        belt.start(0.12, t0).unwrap();
        belt.tick(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(belt.state(), BeltState::Running);

        belt.pause(t0 + Duration::from_secs(3)).unwrap();
        belt.tick(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(belt.state(), BeltState::Stopped);
        assert_eq!(belt.nominal_speed_mps(), 0.0);

        belt.resume(t0 + Duration::from_secs(6)).unwrap();
        belt.tick(t0 + Duration::from_secs(8)).unwrap();
        assert!((belt.nominal_speed_mps() - 0.12).abs() < 1e-9);
    }
}
