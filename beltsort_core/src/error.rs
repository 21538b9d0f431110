use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SorterError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("classifier error: {0}")]
    Classifier(String),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing belt drive")]
    MissingBelt,
    #[error("missing frame source")]
    MissingCamera,
    #[error("missing classifier")]
    MissingClassifier,
    #[error("no diverters configured")]
    NoDiverters,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Why an item left the pipeline without being actuated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Classification finished after the item had already passed the diverter.
    Late,
    /// Destination bin is full or critical.
    BinFull,
    /// Serializing around another activation would have made the fire late.
    Congested,
    /// Belt stopped, ramping, or speed not positive.
    BeltNotReady,
    /// Confidence below threshold and no usable fallback route.
    LowConfidence,
    /// Classifier errored and the item could not be routed.
    ClassifierError,
    /// No diverter configured for the category; the item rides off the belt.
    PassThrough,
    /// The diverter rejected or failed the activation.
    ActuationFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Late => "LATE",
            DropReason::BinFull => "BIN_FULL",
            DropReason::Congested => "CONGESTED",
            DropReason::BeltNotReady => "BELT_NOT_READY",
            DropReason::LowConfidence => "LOW_CONFIDENCE",
            DropReason::ClassifierError => "CLASSIFIER_ERROR",
            DropReason::PassThrough => "PASS_THROUGH",
            DropReason::ActuationFailed => "ACTUATION_FAILED",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
