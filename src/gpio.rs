use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::callback::{CallbackDispatcher, CallbackHandle};
use crate::config::{Edge, GpioConfig, PinConfig, PinMode};
use crate::error::{GpioError, WorkerFault};
use crate::event_log::{EventLog, LogFlusher, PipeTransport};
use crate::pwm::{PwmChannelState, PwmController, PwmKind, PwmSurface, SysfsPwmChip};
use crate::registry::PinRegistry;

const FAULT_CHANNEL_CAPACITY: usize = 16;

pub type GpioController<D> = GenericGpioController<D, SysfsPwmChip>;

/// Edge notification delivered by a [`LineDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub pin: u32,
    pub edge: Edge,
    pub level: u8,
    pub timestamp_ns: u64,
}

pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Line-level access to a GPIO chip.
///
/// Input claims always enable detection on both edges; callbacks filter by
/// the edge they were registered for. Callbacks run on threads owned by the
/// driver.
pub trait LineDriver: Send + Sync + 'static {
    fn claim_input(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError>;
    fn claim_output(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError>;
    fn read(&self, pin: u32) -> Result<u8, GpioError>;
    fn write(&self, pin: u32, level: u8) -> Result<(), GpioError>;
    fn register_callback(
        &self,
        pin: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId, GpioError>;
    /// Unknown ids are ignored.
    fn cancel_callback(&self, id: CallbackId);
    fn set_debounce(&self, pin: u32, micros: u32) -> Result<(), GpioError>;
    /// Drives a waveform on an output line; a zero frequency stops it.
    fn tx_pwm(&self, pin: u32, frequency_hz: f64, duty_percent: f64) -> Result<(), GpioError>;
}

pub struct GenericGpioController<D: LineDriver, S: PwmSurface> {
    config: Arc<GpioConfig>,
    driver: Arc<D>,
    log: Arc<EventLog>,
    registry: Arc<PinRegistry<D>>,
    callbacks: CallbackDispatcher<D>,
    pwm: PwmController<D, S>,
    shutdown: Arc<AtomicBool>,
    faults: broadcast::Sender<WorkerFault>,
    flusher: Mutex<Option<LogFlusher>>,
}

impl<D: LineDriver, S: PwmSurface> GenericGpioController<D, S> {
    /// Creates the log pipe if needed and starts the flush thread.
    pub fn new(config: GpioConfig, driver: Arc<D>, surface: Arc<S>) -> Result<Self, GpioError> {
        config.validate()?;
        let config = Arc::new(config);
        let log = Arc::new(EventLog::new(config.log_capacity));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);

        let interval = Duration::from_millis(config.flush_interval_ms);
        let transport = PipeTransport::create(&config.log_pipe, interval)?;
        let flusher = LogFlusher::spawn(
            log.clone(),
            transport,
            interval,
            shutdown.clone(),
            faults.clone(),
        )?;

        let registry = Arc::new(PinRegistry::new(
            driver.clone(),
            log.clone(),
            config.hardware_pwm.clone(),
        ));
        let callbacks = CallbackDispatcher::new(registry.clone());
        let pwm = PwmController::new(
            driver.clone(),
            surface,
            registry.clone(),
            log.clone(),
            config.hardware_pwm.clone(),
            shutdown.clone(),
            faults.clone(),
        );

        info!("GPIO controller ready on {}", config.chip);

        Ok(Self {
            config,
            driver,
            log,
            registry,
            callbacks,
            pwm,
            shutdown,
            faults,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    pub fn config(&self) -> &GpioConfig {
        &self.config
    }

    /// Claims `pin` with `config`, stopping any PWM channel running on it.
    pub fn set_mode(&self, pin: u32, config: PinConfig) -> Result<(), GpioError> {
        if self.registry.is_reserved(pin) {
            return Err(GpioError::ReservedPin(pin));
        }
        self.pwm.stop(pin);
        self.registry.configure(pin, config)
    }

    pub fn pin_mode(&self, pin: u32) -> Option<PinMode> {
        self.registry.mode_of(pin)
    }

    pub fn pin_config(&self, pin: u32) -> Option<PinConfig> {
        self.registry.config_of(pin)
    }

    /// Reads an input pin. Reads are not logged.
    pub fn read(&self, pin: u32) -> Result<u8, GpioError> {
        self.registry.require(pin, PinMode::Input)?;
        self.driver.read(pin)
    }

    /// Drives an output pin and logs the new level.
    pub fn write(&self, pin: u32, level: u8) -> Result<(), GpioError> {
        if level > 1 {
            return Err(GpioError::InvalidValue("level must be 0 or 1".into()));
        }
        self.registry.require(pin, PinMode::Output)?;
        self.driver.write(pin, level)?;
        self.log.record(pin, level);
        Ok(())
    }

    pub fn add_callback<F>(
        &self,
        pin: u32,
        edge: Edge,
        handler: F,
    ) -> Result<CallbackHandle<D>, GpioError>
    where
        F: Fn(EdgeEvent) + Send + Sync + 'static,
    {
        self.callbacks.add_callback(pin, edge, handler)
    }

    /// Software PWM on any output pin; `frequency_hz == 0` stops it.
    pub fn software_pwm(
        &self,
        pin: u32,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        self.pwm.start_software(pin, frequency_hz, duty_percent)
    }

    /// Hardware PWM on a reserved pin; `frequency_hz == 0` disables the channel.
    pub fn hardware_pwm(
        &self,
        pin: u32,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        self.pwm.start_hardware(pin, frequency_hz, duty_percent)
    }

    /// Stops the PWM output on `pin`, whichever kind it is. No-op when idle.
    pub fn stop_pwm(&self, pin: u32) -> Result<(), GpioError> {
        match self.pwm.channel(pin).map(|c| c.kind) {
            Some(PwmKind::Software) => self.pwm.start_software(pin, 0.0, 0.0),
            Some(PwmKind::Hardware) => self.pwm.start_hardware(pin, 0.0, 0.0),
            None => Ok(()),
        }
    }

    pub fn pwm_channel(&self, pin: u32) -> Option<PwmChannelState> {
        self.pwm.channel(pin)
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<WorkerFault> {
        self.faults.subscribe()
    }

    /// Stops every PWM worker and the flush thread. Safe to call twice.
    pub fn close(&self) {
        self.pwm.stop_all();
        self.shutdown.store(true, Ordering::Release);
        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.join();
            info!("GPIO controller closed");
        }
    }
}

impl<D: LineDriver, S: PwmSurface> Drop for GenericGpioController<D, S> {
    fn drop(&mut self) {
        self.close();
    }
}
