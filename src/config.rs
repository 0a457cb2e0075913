use std::{fmt, fs, path::Path, path::PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const DEFAULT_LOG_CAPACITY: usize = 10_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinMode {
    Input,
    Output,
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::Input => f.write_str("input"),
            PinMode::Output => f.write_str("output"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Bias {
    #[default]
    None,
    PullUp,
    PullDown,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Edge produced by a level change, if any.
    pub fn between(old: u8, new: u8) -> Option<Edge> {
        match (old, new) {
            (0, 1) => Some(Edge::Rising),
            (1, 0) => Some(Edge::Falling),
            _ => None,
        }
    }

    pub fn accepts(&self, observed: Edge) -> bool {
        match self {
            Edge::Both => true,
            _ => *self == observed,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PinConfig {
    pub mode: PinMode,
    #[serde(default)]
    pub bias: Bias,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub open_drain: bool,
    #[serde(default)]
    pub open_source: bool,
    #[serde(default)]
    pub debounce_micros: u32,
    #[serde(default)]
    pub initial_level: u8,
}

impl PinConfig {
    pub fn input() -> Self {
        Self::with_mode(PinMode::Input)
    }

    pub fn output() -> Self {
        Self::with_mode(PinMode::Output)
    }

    fn with_mode(mode: PinMode) -> Self {
        Self {
            mode,
            bias: Bias::None,
            active_low: false,
            open_drain: false,
            open_source: false,
            debounce_micros: 0,
            initial_level: 0,
        }
    }

    pub fn bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub fn open_drain(mut self, open_drain: bool) -> Self {
        self.open_drain = open_drain;
        self
    }

    pub fn open_source(mut self, open_source: bool) -> Self {
        self.open_source = open_source;
        self
    }

    pub fn debounce_micros(mut self, micros: u32) -> Self {
        self.debounce_micros = micros;
        self
    }

    pub fn initial_level(mut self, level: u8) -> Self {
        self.initial_level = level;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), GpioError> {
        if self.initial_level > 1 {
            return Err(GpioError::InvalidValue(
                "initial level must be 0 or 1".into(),
            ));
        }
        if self.open_drain && self.open_source {
            return Err(GpioError::InvalidValue(
                "open-drain and open-source are mutually exclusive".into(),
            ));
        }
        if self.mode == PinMode::Input && (self.open_drain || self.open_source) {
            return Err(GpioError::InvalidValue(
                "drive flags require output mode".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HardwarePwmConfig {
    pub chip_path: PathBuf,
    /// Reserved pin -> sysfs channel number.
    pub channels: FxHashMap<u32, u32>,
}

impl Default for HardwarePwmConfig {
    fn default() -> Self {
        let mut channels = FxHashMap::default();
        channels.insert(18, 2);
        channels.insert(19, 3);
        Self {
            chip_path: PathBuf::from("/sys/class/pwm/pwmchip2"),
            channels,
        }
    }
}

impl HardwarePwmConfig {
    pub fn channel_of(&self, pin: u32) -> Option<u32> {
        self.channels.get(&pin).copied()
    }

    pub fn is_reserved(&self, pin: u32) -> bool {
        self.channels.contains_key(&pin)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GpioConfig {
    pub chip: String,
    pub log_pipe: PathBuf,
    pub log_capacity: usize,
    pub flush_interval_ms: u64,
    pub hardware_pwm: HardwarePwmConfig,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip4".to_string(),
            log_pipe: PathBuf::from("log_pipe"),
            log_capacity: DEFAULT_LOG_CAPACITY,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            hardware_pwm: HardwarePwmConfig::default(),
        }
    }
}

impl GpioConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: GpioConfig = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.log_capacity == 0 {
            return Err(GpioError::Config("log_capacity must be non-zero".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(GpioError::Config(
                "flush_interval_ms must be non-zero".into(),
            ));
        }
        let mut seen = Vec::with_capacity(self.hardware_pwm.channels.len());
        for channel in self.hardware_pwm.channels.values() {
            if seen.contains(channel) {
                return Err(GpioError::Config(format!(
                    "PWM channel {channel} is mapped to more than one pin"
                )));
            }
            seen.push(*channel);
        }
        Ok(())
    }
}
