use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{HwError, Result};

/// Speed of sound at ~20 °C, meters per second.
const SOUND_MPS: f32 = 343.0;

pub struct Hcsr04 {
    trig: rppal::gpio::OutputPin,
    echo: rppal::gpio::InputPin,
}

impl Hcsr04 {
    pub fn new(mut trig: rppal::gpio::OutputPin, echo: rppal::gpio::InputPin) -> Self {
        trig.set_low();
        Self { trig, echo }
    }

    /// Fire one ranging pulse and convert the echo width to meters.
    /// `timeout` bounds the whole measurement; out-of-range targets surface
    /// as [`HwError::EchoTimeout`].
    pub fn measure_distance_m(&mut self, timeout: Duration) -> Result<f32> {
        let deadline = Instant::now() + timeout;

        // 10 us trigger pulse
        self.trig.set_high();
        thread::sleep(Duration::from_micros(10));
        self.trig.set_low();

        // Wait for echo to go high
        while self.echo.is_low() {
            if Instant::now() >= deadline {
                return Err(HwError::EchoTimeout);
            }
            std::hint::spin_loop();
        }
        let rise = Instant::now();

        // Wait for echo to fall
        while self.echo.is_high() {
            if Instant::now() >= deadline {
                return Err(HwError::EchoTimeout);
            }
            std::hint::spin_loop();
        }
        let width = rise.elapsed();

        let distance_m = width.as_secs_f32() * SOUND_MPS / 2.0;
        trace!(distance_m, "ultrasonic read");
        Ok(distance_m)
    }
}
