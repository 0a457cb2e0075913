mod sysfs;

pub use sysfs::{PwmSurface, SysfsPwmChip, program_channel};

use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{HardwarePwmConfig, PinMode};
use crate::error::{GpioError, WorkerFault, WorkerKind};
use crate::event_log::EventLog;
use crate::gpio::LineDriver;
use crate::registry::PinRegistry;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
// how often a constant-level worker rechecks the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PwmKind {
    Software,
    Hardware,
}

/// Snapshot of an active channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PwmChannelState {
    pub pin: u32,
    pub kind: PwmKind,
    pub frequency_hz: f64,
    pub duty_percent: f64,
}

/// High and low durations of one period.
pub fn half_periods(frequency_hz: f64, duty_percent: f64) -> (Duration, Duration) {
    let period_ns = NANOS_PER_SEC / frequency_hz;
    let high_ns = period_ns * duty_percent / 100.0;
    let low_ns = period_ns - high_ns;
    (
        Duration::from_nanos(high_ns as u64),
        Duration::from_nanos(low_ns.max(0.0) as u64),
    )
}

/// Period and duty in nanoseconds as written to the control surface.
pub fn hardware_timing(frequency_hz: f64, duty_percent: f64) -> (u64, u64) {
    let period_ns = (NANOS_PER_SEC / frequency_hz) as u64;
    let duty_ns = (period_ns as f64 * duty_percent / 100.0) as u64;
    (period_ns, duty_ns)
}

fn validate(frequency_hz: f64, duty_percent: f64) -> Result<(), GpioError> {
    if !frequency_hz.is_finite() || frequency_hz < 0.0 {
        return Err(GpioError::InvalidValue(format!(
            "frequency must be a non-negative number, got {frequency_hz}"
        )));
    }
    if !(0.0..=100.0).contains(&duty_percent) {
        return Err(GpioError::InvalidValue(format!(
            "duty cycle must be within 0..=100, got {duty_percent}"
        )));
    }
    Ok(())
}

/// Stop signal shared by a channel and its worker. A zero frequency means
/// "stop"; the condvar wakes the worker out of its half-period sleep.
struct ChannelSignal {
    frequency_hz: Mutex<f64>,
    wake: Condvar,
}

impl ChannelSignal {
    fn new(frequency_hz: f64) -> Self {
        Self {
            frequency_hz: Mutex::new(frequency_hz),
            wake: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self.frequency_hz.lock() = 0.0;
        self.wake.notify_all();
    }

    fn is_running(&self) -> bool {
        *self.frequency_hz.lock() > 0.0
    }

    /// Sleeps for `duration` or until stopped. Returns true once stopped.
    fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut frequency = self.frequency_hz.lock();
        while *frequency > 0.0 {
            if self.wake.wait_until(&mut frequency, deadline).timed_out() {
                break;
            }
        }
        *frequency <= 0.0
    }
}

struct Channel {
    kind: PwmKind,
    duty_percent: f64,
    signal: Arc<ChannelSignal>,
    worker: Option<JoinHandle<()>>,
}

impl Channel {
    fn state(&self, pin: u32) -> PwmChannelState {
        PwmChannelState {
            pin,
            kind: self.kind,
            frequency_hz: *self.signal.frequency_hz.lock(),
            duty_percent: self.duty_percent,
        }
    }
}

/// Mirrors the intended waveform into the event log.
fn simulate(
    pin: u32,
    frequency_hz: f64,
    duty_percent: f64,
    signal: &ChannelSignal,
    log: &EventLog,
    shutdown: &AtomicBool,
) {
    let (high, low) = half_periods(frequency_hz, duty_percent);

    if high.is_zero() || low.is_zero() {
        log.record(pin, u8::from(low.is_zero()));
        while !shutdown.load(Ordering::Acquire) && !signal.wait(IDLE_POLL) {}
        return;
    }

    while signal.is_running() && !shutdown.load(Ordering::Acquire) {
        log.record(pin, 1);
        if signal.wait(high) || shutdown.load(Ordering::Acquire) {
            break;
        }
        log.record(pin, 0);
        if signal.wait(low) {
            break;
        }
    }
}

/// Owns every active PWM channel and its logging worker.
pub struct PwmController<D: LineDriver, S: PwmSurface> {
    driver: Arc<D>,
    surface: Arc<S>,
    registry: Arc<PinRegistry<D>>,
    log: Arc<EventLog>,
    hardware: HardwarePwmConfig,
    shutdown: Arc<AtomicBool>,
    faults: broadcast::Sender<WorkerFault>,
    // serialises start/stop so a pin never has two live workers
    commands: Mutex<()>,
    channels: Mutex<FxHashMap<u32, Channel>>,
}

impl<D: LineDriver, S: PwmSurface> PwmController<D, S> {
    pub fn new(
        driver: Arc<D>,
        surface: Arc<S>,
        registry: Arc<PinRegistry<D>>,
        log: Arc<EventLog>,
        hardware: HardwarePwmConfig,
        shutdown: Arc<AtomicBool>,
        faults: broadcast::Sender<WorkerFault>,
    ) -> Self {
        Self {
            driver,
            surface,
            registry,
            log,
            hardware,
            shutdown,
            faults,
            commands: Mutex::new(()),
            channels: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn start_software(
        &self,
        pin: u32,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        validate(frequency_hz, duty_percent)?;
        self.registry.require(pin, PinMode::Output)?;

        let _guard = self.commands.lock();
        self.driver.tx_pwm(pin, frequency_hz, duty_percent)?;
        self.stop_locked(pin);
        if frequency_hz == 0.0 {
            return Ok(());
        }

        self.spawn_worker(pin, PwmKind::Software, frequency_hz, duty_percent)?;
        info!("software PWM on GPIO {pin}: {frequency_hz} Hz at {duty_percent}%");
        Ok(())
    }

    pub fn start_hardware(
        &self,
        pin: u32,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        validate(frequency_hz, duty_percent)?;
        let channel = self
            .hardware
            .channel_of(pin)
            .ok_or(GpioError::InvalidPin(pin))?;

        let target = (frequency_hz > 0.0).then(|| hardware_timing(frequency_hz, duty_percent));
        if let Some((0, _)) = target {
            return Err(GpioError::InvalidValue(format!(
                "{frequency_hz} Hz is too fast for a nanosecond period"
            )));
        }

        let _guard = self.commands.lock();
        if !self.surface.is_exported(channel) {
            self.surface.export(channel)?;
        }

        // a failed update may leave the output disabled, so the old worker stops either way
        let programmed = program_channel(self.surface.as_ref(), channel, target);
        self.stop_locked(pin);
        programmed?;
        if target.is_none() {
            info!("hardware PWM channel {channel} (GPIO {pin}) disabled");
            return Ok(());
        }

        self.spawn_worker(pin, PwmKind::Hardware, frequency_hz, duty_percent)?;
        info!(
            "hardware PWM channel {channel} (GPIO {pin}): {frequency_hz} Hz at {duty_percent}%"
        );
        Ok(())
    }

    fn spawn_worker(
        &self,
        pin: u32,
        kind: PwmKind,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        let signal = Arc::new(ChannelSignal::new(frequency_hz));
        let worker = {
            let signal = signal.clone();
            let log = self.log.clone();
            let shutdown = self.shutdown.clone();
            thread::Builder::new()
                .name(format!("pwm-gpio{pin}"))
                .spawn(move || {
                    simulate(pin, frequency_hz, duty_percent, &signal, &log, &shutdown)
                })
                .map_err(|e| GpioError::Driver(format!("spawn PWM worker for GPIO {pin}: {e}")))?
        };

        self.channels.lock().insert(
            pin,
            Channel {
                kind,
                duty_percent,
                signal,
                worker: Some(worker),
            },
        );
        Ok(())
    }

    /// Stops the worker on `pin` and forgets the channel. No-op when idle.
    pub fn stop(&self, pin: u32) {
        let _guard = self.commands.lock();
        self.stop_locked(pin);
    }

    fn stop_locked(&self, pin: u32) {
        let (signal, worker) = {
            let mut channels = self.channels.lock();
            let Some(channel) = channels.get_mut(&pin) else {
                return;
            };
            (channel.signal.clone(), channel.worker.take())
        };
        signal.stop();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("PWM worker for GPIO {pin} panicked");
            let _ = self.faults.send(WorkerFault {
                worker: WorkerKind::Pwm(pin),
                message: "worker panicked".into(),
            });
        }
        self.channels.lock().remove(&pin);
        info!("PWM on GPIO {pin} stopped");
    }

    pub fn stop_all(&self) {
        let _guard = self.commands.lock();
        let pins: Vec<u32> = self.channels.lock().keys().copied().collect();
        for pin in pins {
            self.stop_locked(pin);
        }
    }

    pub fn channel(&self, pin: u32) -> Option<PwmChannelState> {
        self.channels.lock().get(&pin).map(|c| c.state(pin))
    }

    pub fn active_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.channels.lock().keys().copied().collect();
        pins.sort_unstable();
        pins
    }
}
