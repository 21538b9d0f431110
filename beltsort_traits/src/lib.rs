pub mod clock;

pub use clock::{Clock, MonotonicClock};

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical material classes the sorter routes. Closed set; classifier
/// aliases are mapped onto these at the classification seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Metal,
    Plastic,
    Glass,
    Carton,
    Other,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Metal,
        Category::Plastic,
        Category::Glass,
        Category::Carton,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Metal => "metal",
            Category::Plastic => "plastic",
            Category::Glass => "glass",
            Category::Carton => "carton",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metal" => Ok(Category::Metal),
            "plastic" => Ok(Category::Plastic),
            "glass" => Ok(Category::Glass),
            "carton" => Ok(Category::Carton),
            "other" => Ok(Category::Other),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Opaque camera frame handle passed from capture to classification.
/// The pixel payload is owned here so the item pipeline can move it by value.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Axis-aligned bounding box in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A single raw detection as produced by the inference backend. The label is
/// whatever the model emits; canonical mapping happens downstream.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BBox>,
}

/// Frame capture device (camera or a simulated source).
pub trait FrameSource {
    fn capture(&mut self, timeout: Duration) -> Result<Frame, BoxError>;
}

/// Inference backend. `deadline` is the per-call inference budget; backends
/// should give up and return an error rather than overrun it.
pub trait Classifier {
    fn classify(&mut self, frame: &Frame, deadline: Duration) -> Result<Vec<Detection>, BoxError>;
}

/// A diverter mechanism: stepper arm or gated flap. One activation deflects
/// one item. Implementations allow a single in-flight activation and fail
/// fast on concurrent calls.
pub trait Actuator {
    fn initialize(&mut self) -> Result<(), BoxError>;
    /// Move out, hold for `duration`, and return (for mechanisms that home).
    /// Blocks for the full cycle.
    fn activate(&mut self, duration: Duration) -> Result<(), BoxError>;
    /// Drive back to the rest position.
    fn home(&mut self) -> Result<(), BoxError>;
    fn shutdown(&mut self) -> Result<(), BoxError>;
}

/// Conveyor motor behind a PWM (or on/off) driver. Ramping is the belt
/// controller's job; this is the raw duty-cycle seam.
pub trait BeltDrive {
    /// Set the PWM duty cycle in percent (0..=100).
    fn set_duty(&mut self, duty_pct: f32) -> Result<(), BoxError>;
    /// Cut power immediately (emergency path, no ramp).
    fn power_off(&mut self) -> Result<(), BoxError>;
}

/// Edge-triggered digital input (camera trigger). Blocks until the next raw
/// edge or timeout; debounce is applied by the listener that owns this.
pub trait EdgeInput {
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<Instant>, BoxError>;
}

/// Distance-ranging fill sensor on a bin (ultrasonic or similar).
/// Returns the distance to the refuse surface in meters.
pub trait LevelSensor {
    fn measure(&mut self, timeout: Duration) -> Result<f32, BoxError>;
}

/// Host health probe: CPU, memory, and SoC temperature.
pub trait SystemProbe {
    fn cpu_percent(&mut self) -> Result<f32, BoxError>;
    fn memory_percent(&mut self) -> Result<f32, BoxError>;
    fn temperature_c(&mut self) -> Result<f32, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_names() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
    }

    #[test]
    fn category_parse_is_case_insensitive() {
        assert_eq!("Metal".parse::<Category>().unwrap(), Category::Metal);
        assert!("cardboard".parse::<Category>().is_err());
    }
}
