//! beltsort_hardware: hardware and simulation backends behind `beltsort_traits`.
//!
//! Features:
//! - `hardware`: enable Raspberry Pi GPIO-backed implementations (steppers,
//!   on/off diverters, PWM belt drive, trigger input, ultrasonic bin sensors).
//! - (default) no `hardware` feature: simulation types that satisfy the traits.
//!
//! Note: The `rppal` dependency is optional and only enabled when the `hardware`
//!       feature is active. This lets CI on x86 build without pulling GPIO libs.

pub mod error;
pub mod frontend;
pub mod probe;

#[cfg(feature = "hardware")]
mod ultrasonic;

#[cfg(not(feature = "hardware"))]
pub mod sim {
    use beltsort_traits::{
        Actuator, BeltDrive, BoxError, EdgeInput, LevelSensor, SystemProbe,
    };
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Diverter stand-in that records activations; can be told to fail.
    #[derive(Clone, Default)]
    pub struct SimDiverter {
        state: Arc<Mutex<SimDiverterState>>,
    }

    #[derive(Default)]
    struct SimDiverterState {
        activations: Vec<(Instant, Duration)>,
        fail_next: u32,
    }

    impl SimDiverter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn activation_count(&self) -> usize {
            self.state.lock().map(|s| s.activations.len()).unwrap_or(0)
        }

        pub fn activations(&self) -> Vec<(Instant, Duration)> {
            self.state
                .lock()
                .map(|s| s.activations.clone())
                .unwrap_or_default()
        }

        pub fn fail_next(&self, n: u32) {
            if let Ok(mut s) = self.state.lock() {
                s.fail_next = n;
            }
        }
    }

    impl Actuator for SimDiverter {
        fn initialize(&mut self) -> Result<(), BoxError> {
            Ok(())
        }

        fn activate(&mut self, duration: Duration) -> Result<(), BoxError> {
            let mut s = self.state.lock().map_err(|_| "sim diverter poisoned")?;
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err("simulated actuator fault".into());
            }
            s.activations.push((Instant::now(), duration));
            Ok(())
        }

        fn home(&mut self) -> Result<(), BoxError> {
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    /// Belt motor stand-in; remembers the last duty cycle.
    #[derive(Clone, Default)]
    pub struct SimBeltDrive {
        duty: Arc<Mutex<f32>>,
    }

    impl SimBeltDrive {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn duty(&self) -> f32 {
            self.duty.lock().map(|d| *d).unwrap_or(0.0)
        }
    }

    impl BeltDrive for SimBeltDrive {
        fn set_duty(&mut self, duty_pct: f32) -> Result<(), BoxError> {
            let mut d = self.duty.lock().map_err(|_| "sim belt poisoned")?;
            *d = duty_pct.clamp(0.0, 100.0);
            Ok(())
        }

        fn power_off(&mut self) -> Result<(), BoxError> {
            let mut d = self.duty.lock().map_err(|_| "sim belt poisoned")?;
            *d = 0.0;
            Ok(())
        }
    }

    /// Trigger input fed by tests: push timestamps, the listener drains them.
    #[derive(Clone, Default)]
    pub struct SimEdgeInput {
        edges: Arc<Mutex<VecDeque<Instant>>>,
    }

    impl SimEdgeInput {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_edge(&self, at: Instant) {
            if let Ok(mut q) = self.edges.lock() {
                q.push_back(at);
            }
        }
    }

    impl EdgeInput for SimEdgeInput {
        fn wait_edge(&mut self, _timeout: Duration) -> Result<Option<Instant>, BoxError> {
            let edge = self.edges.lock().ok().and_then(|mut q| q.pop_front());
            Ok(edge)
        }
    }

    /// Bin level sensor with an externally settable distance.
    #[derive(Clone)]
    pub struct SimLevelSensor {
        distance_m: Arc<Mutex<Result<f32, String>>>,
    }

    impl SimLevelSensor {
        pub fn new(distance_m: f32) -> Self {
            Self {
                distance_m: Arc::new(Mutex::new(Ok(distance_m))),
            }
        }

        pub fn set_distance(&self, d: f32) {
            if let Ok(mut v) = self.distance_m.lock() {
                *v = Ok(d);
            }
        }

        pub fn set_error(&self, msg: &str) {
            if let Ok(mut v) = self.distance_m.lock() {
                *v = Err(msg.to_string());
            }
        }
    }

    impl LevelSensor for SimLevelSensor {
        fn measure(&mut self, _timeout: Duration) -> Result<f32, BoxError> {
            match self.distance_m.lock() {
                Ok(v) => v.clone().map_err(|e| e.into()),
                Err(_) => Err("sim sensor poisoned".into()),
            }
        }
    }

    /// Host probe with settable readings.
    #[derive(Clone)]
    pub struct SimProbe {
        inner: Arc<Mutex<(f32, f32, f32)>>,
    }

    impl Default for SimProbe {
        fn default() -> Self {
            Self::new(10.0, 30.0, 45.0)
        }
    }

    impl SimProbe {
        pub fn new(cpu: f32, mem: f32, temp: f32) -> Self {
            Self {
                inner: Arc::new(Mutex::new((cpu, mem, temp))),
            }
        }

        pub fn set(&self, cpu: f32, mem: f32, temp: f32) {
            if let Ok(mut v) = self.inner.lock() {
                *v = (cpu, mem, temp);
            }
        }
    }

    impl SystemProbe for SimProbe {
        fn cpu_percent(&mut self) -> Result<f32, BoxError> {
            Ok(self.inner.lock().map_err(|_| "poisoned")?.0)
        }

        fn memory_percent(&mut self) -> Result<f32, BoxError> {
            Ok(self.inner.lock().map_err(|_| "poisoned")?.1)
        }

        fn temperature_c(&mut self) -> Result<f32, BoxError> {
            Ok(self.inner.lock().map_err(|_| "poisoned")?.2)
        }
    }
}

#[cfg(feature = "hardware")]
pub mod hardware {
    use crate::error::HwError;
    use crate::ultrasonic::Hcsr04;
    use beltsort_traits::{Actuator, BeltDrive, BoxError, EdgeInput, LevelSensor};
    use rppal::gpio::{Gpio, InputPin, Level, OutputPin};
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use std::thread;
    use std::time::{Duration, Instant};
    use tracing::{info, warn};

    fn gpio_err(e: rppal::gpio::Error) -> HwError {
        HwError::Gpio(e.to_string())
    }

    /// PWM-driven belt motor on a single GPIO pin (software PWM).
    pub struct PwmBeltDrive {
        pin: OutputPin,
        frequency_hz: f64,
    }

    impl PwmBeltDrive {
        pub fn try_new(motor_pin: u8, frequency_hz: f64) -> Result<Self, HwError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let pin = gpio.get(motor_pin).map_err(gpio_err)?.into_output_low();
            Ok(Self { pin, frequency_hz })
        }
    }

    impl BeltDrive for PwmBeltDrive {
        fn set_duty(&mut self, duty_pct: f32) -> Result<(), BoxError> {
            let duty = f64::from(duty_pct.clamp(0.0, 100.0)) / 100.0;
            self.pin
                .set_pwm_frequency(self.frequency_hz, duty)
                .map_err(|e| Box::new(gpio_err(e)) as BoxError)
        }

        fn power_off(&mut self) -> Result<(), BoxError> {
            let _ = self.pin.clear_pwm();
            self.pin.set_low();
            Ok(())
        }
    }

    impl Drop for PwmBeltDrive {
        fn drop(&mut self) {
            let _ = self.pin.clear_pwm();
            self.pin.set_low();
        }
    }

    /// Stepper step timing parameters (linear ramp).
    #[derive(Debug, Clone, Copy)]
    pub struct StepperTiming {
        pub start_delay: Duration,
        pub min_delay: Duration,
        pub accel_steps: u32,
        pub use_ramping: bool,
    }

    /// A4988/DRV8825-style stepper diverter arm: direction + step + optional
    /// active-low enable pin. `activate` swings out, holds, and (when homing
    /// is configured) reverses the same number of steps.
    pub struct StepperDiverter {
        step: OutputPin,
        dir: OutputPin,
        en: Option<OutputPin>,
        steps_per_activation: u32,
        direction_cw: bool,
        return_to_home: bool,
        timing: StepperTiming,
        busy: Arc<AtomicBool>,
    }

    impl StepperDiverter {
        #[allow(clippy::too_many_arguments)]
        pub fn try_new(
            step_pin: u8,
            dir_pin: u8,
            enable_pin: Option<u8>,
            steps_per_activation: u32,
            direction_cw: bool,
            return_to_home: bool,
            timing: StepperTiming,
        ) -> Result<Self, HwError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let step = gpio.get(step_pin).map_err(gpio_err)?.into_output_low();
            let dir = gpio.get(dir_pin).map_err(gpio_err)?.into_output_low();
            // Enable is active-low on these drivers; start disabled (high).
            let en = match enable_pin {
                Some(p) => Some(gpio.get(p).map_err(gpio_err)?.into_output_high()),
                None => None,
            };
            Ok(Self {
                step,
                dir,
                en,
                steps_per_activation,
                direction_cw,
                return_to_home,
                timing,
                busy: Arc::new(AtomicBool::new(false)),
            })
        }

        fn set_enabled(&mut self, enabled: bool) {
            if let Some(en) = self.en.as_mut() {
                if enabled {
                    en.set_low();
                } else {
                    en.set_high();
                }
            }
        }

        fn step_delay(&self, i: u32, total: u32) -> Duration {
            let t = self.timing;
            if !t.use_ramping {
                return t.min_delay;
            }
            let accel = t.accel_steps.min(total / 2).max(1);
            let span = t.start_delay.saturating_sub(t.min_delay);
            if i < accel {
                // accelerate: start -> min
                t.start_delay - span.mul_f64(f64::from(i) / f64::from(accel))
            } else if i >= total - accel {
                // decelerate: min -> start
                let into = i - (total - accel);
                t.min_delay + span.mul_f64(f64::from(into) / f64::from(accel))
            } else {
                t.min_delay
            }
        }

        fn run_steps(&mut self, clockwise: bool, steps: u32) {
            if clockwise {
                self.dir.set_high();
            } else {
                self.dir.set_low();
            }
            // Let the direction line settle before the first pulse.
            thread::sleep(Duration::from_millis(1));
            for i in 0..steps {
                let half = self.step_delay(i, steps);
                self.step.set_high();
                thread::sleep(half);
                self.step.set_low();
                thread::sleep(half);
            }
        }
    }

    impl Actuator for StepperDiverter {
        fn initialize(&mut self) -> Result<(), BoxError> {
            self.step.set_low();
            self.set_enabled(false);
            Ok(())
        }

        fn activate(&mut self, duration: Duration) -> Result<(), BoxError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(Box::new(HwError::Busy));
            }
            self.set_enabled(true);
            self.run_steps(self.direction_cw, self.steps_per_activation);
            thread::sleep(duration);
            if self.return_to_home {
                self.run_steps(!self.direction_cw, self.steps_per_activation);
            }
            self.set_enabled(false);
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn home(&mut self) -> Result<(), BoxError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(Box::new(HwError::Busy));
            }
            self.set_enabled(true);
            self.run_steps(!self.direction_cw, self.steps_per_activation);
            self.set_enabled(false);
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), BoxError> {
            self.set_enabled(false);
            info!("stepper diverter disabled");
            Ok(())
        }
    }

    /// Relay/solenoid diverter gate on a single pin.
    pub struct OnOffDiverter {
        pin: OutputPin,
        active_level: Level,
        busy: Arc<AtomicBool>,
    }

    impl OnOffDiverter {
        pub fn try_new(pin_bcm: u8, active_high: bool) -> Result<Self, HwError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let active_level = if active_high { Level::High } else { Level::Low };
            let pin = if active_high {
                gpio.get(pin_bcm).map_err(gpio_err)?.into_output_low()
            } else {
                gpio.get(pin_bcm).map_err(gpio_err)?.into_output_high()
            };
            Ok(Self {
                pin,
                active_level,
                busy: Arc::new(AtomicBool::new(false)),
            })
        }

        fn write(&mut self, active: bool) {
            let level = if active {
                self.active_level
            } else {
                match self.active_level {
                    Level::High => Level::Low,
                    Level::Low => Level::High,
                }
            };
            self.pin.write(level);
        }
    }

    impl Actuator for OnOffDiverter {
        fn initialize(&mut self) -> Result<(), BoxError> {
            self.write(false);
            Ok(())
        }

        fn activate(&mut self, duration: Duration) -> Result<(), BoxError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(Box::new(HwError::Busy));
            }
            self.write(true);
            thread::sleep(duration);
            self.write(false);
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn home(&mut self) -> Result<(), BoxError> {
            self.write(false);
            Ok(())
        }

        fn shutdown(&mut self) -> Result<(), BoxError> {
            self.write(false);
            Ok(())
        }
    }

    /// Camera trigger input: polls for the configured transition.
    pub struct GpioEdgeInput {
        pin: InputPin,
        rising: bool,
        last: Level,
    }

    impl GpioEdgeInput {
        pub fn try_new(pin_bcm: u8, rising: bool) -> Result<Self, HwError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let pin = gpio.get(pin_bcm).map_err(gpio_err)?.into_input();
            let last = pin.read();
            Ok(Self { pin, rising, last })
        }
    }

    impl EdgeInput for GpioEdgeInput {
        fn wait_edge(&mut self, timeout: Duration) -> Result<Option<Instant>, BoxError> {
            let deadline = Instant::now() + timeout;
            loop {
                let level = self.pin.read();
                let fired = match (self.last, level) {
                    (Level::Low, Level::High) => self.rising,
                    (Level::High, Level::Low) => !self.rising,
                    _ => false,
                };
                self.last = level;
                if fired {
                    return Ok(Some(Instant::now()));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Ultrasonic bin level sensor (HC-SR04 wiring).
    pub struct UltrasonicLevelSensor {
        driver: Hcsr04,
    }

    impl UltrasonicLevelSensor {
        pub fn try_new(trigger_pin: u8, echo_pin: u8) -> Result<Self, HwError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let trig = gpio.get(trigger_pin).map_err(gpio_err)?.into_output_low();
            let echo = gpio.get(echo_pin).map_err(gpio_err)?.into_input();
            Ok(Self {
                driver: Hcsr04::new(trig, echo),
            })
        }
    }

    impl LevelSensor for UltrasonicLevelSensor {
        fn measure(&mut self, timeout: Duration) -> Result<f32, BoxError> {
            self.driver
                .measure_distance_m(timeout)
                .map_err(|e| Box::new(e) as BoxError)
        }
    }

    /// E-stop checker: samples a GPIO on a background thread and exposes the
    /// latched level as a closure, like the safety loop expects.
    pub fn make_estop_checker(
        pin: u8,
        active_low: bool,
        poll_ms: u64,
    ) -> Result<Box<dyn Fn() -> bool + Send + Sync>, HwError> {
        let gpio = Gpio::new().map_err(gpio_err)?;
        let pin = gpio.get(pin).map_err(gpio_err)?.into_input();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_bg = flag.clone();
        thread::spawn(move || {
            loop {
                let level_low = pin.read() == Level::Low;
                let active = if active_low { level_low } else { !level_low };
                flag_bg.store(active, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(poll_ms.max(1)));
            }
        });
        warn!(pin_poll_ms = poll_ms, "E-stop sampling thread started");
        Ok(Box::new(move || flag.load(Ordering::Relaxed)))
    }
}

// Re-exports for callers (CLI/tests) to pick the right backend easily.
#[cfg(not(feature = "hardware"))]
pub use sim::{SimBeltDrive, SimDiverter, SimEdgeInput, SimLevelSensor, SimProbe};

#[cfg(feature = "hardware")]
pub use hardware::{
    GpioEdgeInput, OnOffDiverter, PwmBeltDrive, StepperDiverter, StepperTiming,
    UltrasonicLevelSensor, make_estop_checker,
};

pub use frontend::{SimCamera, SimClassifier};
pub use probe::ProcProbe;
