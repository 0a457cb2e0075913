use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Bias, Edge, PinConfig, PinMode};
use crate::error::GpioError;
use crate::event_log::epoch_nanos;
use crate::gpio::{CallbackId, EdgeCallback, EdgeEvent, LineDriver};

/// In-memory line driver. Input levels only change through
/// [`MockLineDriver::inject_level`].
#[derive(Default)]
pub struct MockLineDriver {
    lines: RwLock<FxHashMap<u32, MockLine>>,
    callbacks: RwLock<FxHashMap<CallbackId, Registration>>,
    unavailable: FxHashSet<u32>,
    next_id: AtomicU64,
}

struct MockLine {
    config: PinConfig,
    value: u8,
    debounce_micros: u32,
    last_event: Option<Instant>,
    tx_pwm: Option<(f64, f64)>,
}

struct Registration {
    pin: u32,
    edge: Edge,
    callback: EdgeCallback,
}

impl MockLineDriver {
    /// Claims on any of `pins` fail as if the line were busy.
    pub fn with_unavailable<I: IntoIterator<Item = u32>>(pins: I) -> Self {
        Self {
            unavailable: pins.into_iter().collect(),
            ..Self::default()
        }
    }

    fn claim(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        if self.unavailable.contains(&pin) {
            return Err(GpioError::Driver(format!("claim GPIO {pin}: line busy")));
        }
        let value = match config.mode {
            PinMode::Input => match config.bias {
                Bias::PullUp => 1,
                _ => 0,
            },
            PinMode::Output => config.initial_level,
        };
        self.lines.write().insert(
            pin,
            MockLine {
                config: config.clone(),
                value,
                debounce_micros: 0,
                last_event: None,
                tx_pwm: None,
            },
        );
        Ok(())
    }

    /// Simulates an external level change on an input line, dispatching the
    /// matching callbacks on the calling thread.
    pub fn inject_level(&self, pin: u32, level: u8) -> Result<(), GpioError> {
        let edge = {
            let mut lines = self.lines.write();
            let line = lines
                .get_mut(&pin)
                .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
            if line.config.mode != PinMode::Input {
                return Err(GpioError::Driver(format!("GPIO {pin} is not an input")));
            }

            let old = line.value;
            line.value = level;
            let Some(edge) = Edge::between(old, level) else {
                return Ok(());
            };

            let now = Instant::now();
            let debounce = line.debounce_micros as u128;
            let allow = line
                .last_event
                .map(|t| now.duration_since(t).as_micros() >= debounce)
                .unwrap_or(true);
            if !allow {
                return Ok(());
            }
            line.last_event = Some(now);
            edge
        };

        let event = EdgeEvent {
            pin,
            edge,
            level,
            timestamp_ns: epoch_nanos(),
        };
        // invoke outside the locks so callbacks may call back into the driver
        let mut targets: Vec<(CallbackId, EdgeCallback)> = self
            .callbacks
            .read()
            .iter()
            .filter(|(_, r)| r.pin == pin && r.edge.accepts(edge))
            .map(|(id, r)| (*id, r.callback.clone()))
            .collect();
        targets.sort_by_key(|(id, _)| id.0);
        for (_, callback) in targets {
            callback(event);
        }
        Ok(())
    }

    pub fn level(&self, pin: u32) -> Option<u8> {
        self.lines.read().get(&pin).map(|l| l.value)
    }

    pub fn mode(&self, pin: u32) -> Option<PinMode> {
        self.lines.read().get(&pin).map(|l| l.config.mode)
    }

    pub fn debounce_of(&self, pin: u32) -> Option<u32> {
        self.lines.read().get(&pin).map(|l| l.debounce_micros)
    }

    /// Last `(frequency_hz, duty_percent)` requested through `tx_pwm`.
    pub fn tx_pwm_of(&self, pin: u32) -> Option<(f64, f64)> {
        self.lines.read().get(&pin).and_then(|l| l.tx_pwm)
    }

    pub fn callback_count(&self, pin: u32) -> usize {
        self.callbacks
            .read()
            .values()
            .filter(|r| r.pin == pin)
            .count()
    }
}

impl LineDriver for MockLineDriver {
    fn claim_input(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        self.claim(pin, config)
    }

    fn claim_output(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        self.claim(pin, config)
    }

    fn read(&self, pin: u32) -> Result<u8, GpioError> {
        self.level(pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))
    }

    fn write(&self, pin: u32, level: u8) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        let line = lines
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
        if line.config.mode != PinMode::Output {
            return Err(GpioError::Driver(format!("GPIO {pin} is not an output")));
        }
        line.value = level;
        Ok(())
    }

    fn register_callback(
        &self,
        pin: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId, GpioError> {
        if !self.lines.read().contains_key(&pin) {
            return Err(GpioError::Driver(format!("GPIO {pin} not claimed")));
        }
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .insert(id, Registration { pin, edge, callback });
        Ok(id)
    }

    fn cancel_callback(&self, id: CallbackId) {
        self.callbacks.write().remove(&id);
    }

    fn set_debounce(&self, pin: u32, micros: u32) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        let line = lines
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
        line.debounce_micros = micros;
        Ok(())
    }

    fn tx_pwm(&self, pin: u32, frequency_hz: f64, duty_percent: f64) -> Result<(), GpioError> {
        let mut lines = self.lines.write();
        let line = lines
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
        if line.config.mode != PinMode::Output {
            return Err(GpioError::Driver(format!("GPIO {pin} is not an output")));
        }
        line.tx_pwm = (frequency_hz > 0.0).then_some((frequency_hz, duty_percent));
        Ok(())
    }
}
