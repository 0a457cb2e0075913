use thiserror::Error;

use crate::config::PinMode;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("GPIO {0} is reserved for hardware PWM")]
    ReservedPin(u32),
    #[error("GPIO {pin} must be in {expected} mode, found {actual}")]
    Mode {
        pin: u32,
        expected: PinMode,
        actual: ModeState,
    },
    #[error("GPIO {0} has no hardware PWM channel")]
    InvalidPin(u32),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// What a pin looked like when a mode check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Unconfigured,
    Configured(PinMode),
}

impl std::fmt::Display for ModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeState::Unconfigured => f.write_str("unconfigured"),
            ModeState::Configured(mode) => write!(f, "{mode}"),
        }
    }
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Driver(err.to_string())
    }
}

impl GpioError {
    pub(crate) fn mode(pin: u32, expected: PinMode, actual: Option<PinMode>) -> Self {
        GpioError::Mode {
            pin,
            expected,
            actual: actual.map_or(ModeState::Unconfigured, ModeState::Configured),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    LogFlush,
    Pwm(u32),
}

/// Published when a background worker stops because of an unexpected error.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    pub worker: WorkerKind,
    pub message: String,
}
