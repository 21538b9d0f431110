use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("echo timeout")]
    EchoTimeout,
    #[error("capture timeout")]
    CaptureTimeout,
    #[error("actuator busy")]
    Busy,
    #[error("actuator disabled")]
    Disabled,
    #[error("probe unavailable: {0}")]
    Probe(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
