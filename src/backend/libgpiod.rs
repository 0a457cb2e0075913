use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{JoinHandle, sleep, yield_now};
use std::time::{Duration, Instant};

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{Bias, Edge, PinConfig, PinMode};
use crate::error::GpioError;
use crate::gpio::{CallbackId, EdgeCallback, EdgeEvent, LineDriver};
use crate::pwm::half_periods;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);
const LIBGPIOD_BACKEND_WAVE_SLICE: Duration = Duration::from_millis(10);

struct Registration {
    pin: u32,
    edge: Edge,
    callback: EdgeCallback,
}

type CallbackTable = Arc<RwLock<FxHashMap<CallbackId, Registration>>>;

/// Line driver on top of the libgpiod v2 character-device API.
pub struct LibgpiodBackend {
    chip: String,
    pins: RwLock<FxHashMap<u32, PinHandle>>,
    callbacks: CallbackTable,
    next_id: AtomicU64,
}

struct PinHandle {
    config: PinConfig,
    // threads go first so they are joined before the request is released
    listener: Option<EdgeListener>,
    wave: Option<WaveGenerator>,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, GpioError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, GpioError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| GpioError::Driver(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, GpioError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::Driver(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| GpioError::Driver(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Driver(format!("request lines: {e}")))
    }

    fn set_level(&mut self, offset: u32, level: u8) -> Result<(), GpioError> {
        self.request
            .set_value(offset, to_value(level))
            .map(|_| ())
            .map_err(|e| GpioError::Driver(format!("set value: {e}")))
    }
}

fn to_value(level: u8) -> line::Value {
    match level {
        0 => line::Value::InActive,
        _ => line::Value::Active,
    }
}

/// Dispatches edge events of one input line to every matching callback.
struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        callbacks: CallbackTable,
    ) -> Result<Self, GpioError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::Driver(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let mut observed = Vec::new();
                {
                    let hdl = gpiod_handle.lock();
                    let req = &hdl.request;

                    let has_event =
                        match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("wait edge events error for GPIO {pin}: {e}");
                                drop(hdl);
                                yield_now();
                                continue;
                            }
                        };
                    if !has_event {
                        continue;
                    }

                    let events = match req.read_edge_events(&mut buffer) {
                        Ok(evts) => evts,
                        Err(e) => {
                            warn!("read edge events error for GPIO {pin}: {e}");
                            drop(hdl);
                            yield_now();
                            continue;
                        }
                    };
                    if cancel_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    for evt in events {
                        let Ok(evt) = evt else { continue };
                        let (edge, level) = match evt.event_type() {
                            Ok(line::EdgeKind::Rising) => (Edge::Rising, 1),
                            Ok(line::EdgeKind::Falling) => (Edge::Falling, 0),
                            Err(_) => continue,
                        };
                        observed.push(EdgeEvent {
                            pin,
                            edge,
                            level,
                            timestamp_ns: evt.timestamp().as_nanos() as u64,
                        });
                    }
                }

                // callbacks run without the request lock so they may read the line
                for event in observed {
                    let targets: Vec<EdgeCallback> = callbacks
                        .read()
                        .values()
                        .filter(|r| r.pin == pin && r.edge.accepts(event.edge))
                        .map(|r| r.callback.clone())
                        .collect();
                    for callback in targets {
                        callback(event);
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stops dispatching without waiting for the thread.
    fn retire(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Toggles an output line to produce a PWM waveform.
struct WaveGenerator {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WaveGenerator {
    fn new(
        pin: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<Self, GpioError> {
        let (high, low) = half_periods(frequency_hz, duty_percent);
        if high.is_zero() || low.is_zero() {
            gpiod_handle
                .lock()
                .set_level(pin, u8::from(low.is_zero()))?;
            return Ok(Self {
                cancel: Arc::new(AtomicBool::new(true)),
                handle: None,
            });
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let retired = cancel.clone();
        let pause = move |duration: Duration| {
            let deadline = Instant::now() + duration;
            loop {
                if cancel_flag.load(Ordering::Relaxed) {
                    return false;
                }
                let now = Instant::now();
                if now >= deadline {
                    return true;
                }
                sleep((deadline - now).min(LIBGPIOD_BACKEND_WAVE_SLICE));
            }
        };

        let handle = std::thread::spawn(move || {
            loop {
                for (level, duration) in [(1, high), (0, low)] {
                    let mut gpiod = gpiod_handle.lock();
                    if retired.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(e) = gpiod.set_level(pin, level) {
                        warn!("PWM waveform on GPIO {pin} stopped: {e}");
                        return;
                    }
                    drop(gpiod);
                    if !pause(duration) {
                        return;
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl WaveGenerator {
    fn retire(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for WaveGenerator {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(chip: impl Into<String>) -> Result<Self, GpioError> {
        let chip = chip.into();
        // fail early on a missing chip rather than at the first claim
        GpiodHandle::open_chip(&chip)?;
        Ok(Self {
            chip,
            pins: RwLock::new(FxHashMap::default()),
            callbacks: Arc::new(RwLock::new(FxHashMap::default())),
            next_id: AtomicU64::new(0),
        })
    }

    fn make_line_settings(
        config: &PinConfig,
        debounce_micros: u32,
    ) -> Result<line::Settings, GpioError> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::Driver(format!("libgpiod settings: {e}")))?;
        ls.set_active_low(config.active_low);

        match config.mode {
            PinMode::Output => {
                let drive = if config.open_drain {
                    line::Drive::OpenDrain
                } else if config.open_source {
                    line::Drive::OpenSource
                } else {
                    line::Drive::PushPull
                };
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| GpioError::Driver(format!("set direction: {e}")))?;
                ls.set_drive(drive)
                    .map_err(|e| GpioError::Driver(format!("set drive: {e}")))?;
                ls.set_output_value(to_value(config.initial_level))
                    .map_err(|e| GpioError::Driver(format!("set output value: {e}")))?;
            }
            PinMode::Input => {
                let bias = match config.bias {
                    Bias::None => None,
                    Bias::PullUp => Some(line::Bias::PullUp),
                    Bias::PullDown => Some(line::Bias::PullDown),
                };
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| GpioError::Driver(format!("set direction: {e}")))?;
                ls.set_bias(bias)
                    .map_err(|e| GpioError::Driver(format!("set bias: {e}")))?;
                ls.set_edge_detection(Some(line::Edge::Both))
                    .map_err(|e| GpioError::Driver(format!("set edge detection: {e}")))?;
                ls.set_event_clock(EventClock::Realtime)
                    .map_err(|e| GpioError::Driver(format!("set event clock: {e}")))?;
                ls.set_debounce_period(Duration::from_micros(debounce_micros as u64));
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::Driver(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::Driver(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn claim(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        let line_settings = Self::make_line_settings(config, 0)?;
        let line_cfg = Self::make_line_config(pin, line_settings)?;

        // joined only after the map lock is gone: a listener may be inside a
        // callback that reads a line
        let retired: (Option<EdgeListener>, Option<WaveGenerator>);
        let mut pins = self.pins.write();
        match pins.get_mut(&pin) {
            Some(handle) => {
                {
                    let mut gpiod = handle.gpiod_handle.lock();
                    gpiod
                        .request
                        .reconfigure_lines(&line_cfg)
                        .map_err(|e| GpioError::Driver(format!("reconfigure GPIO {pin}: {e}")))?;
                    // under the request lock, so the old threads never touch the new setup
                    if let Some(listener) = &handle.listener {
                        listener.retire();
                    }
                    if let Some(wave) = &handle.wave {
                        wave.retire();
                    }
                }
                retired = (handle.listener.take(), handle.wave.take());
                handle.config = config.clone();
                if config.mode == PinMode::Input {
                    handle.listener = Some(EdgeListener::new(
                        pin,
                        handle.gpiod_handle.clone(),
                        self.callbacks.clone(),
                    )?);
                }
            }
            None => {
                retired = (None, None);
                let gpiod = GpiodHandle::new(&self.chip, &line_cfg)?;
                let gpiod_handle = Arc::new(FairMutex::new(gpiod));
                let listener = match config.mode {
                    PinMode::Input => Some(EdgeListener::new(
                        pin,
                        gpiod_handle.clone(),
                        self.callbacks.clone(),
                    )?),
                    PinMode::Output => None,
                };
                pins.insert(
                    pin,
                    PinHandle {
                        config: config.clone(),
                        listener,
                        wave: None,
                        gpiod_handle,
                    },
                );
            }
        }
        drop(pins);
        drop(retired);
        Ok(())
    }
}

impl LineDriver for LibgpiodBackend {
    fn claim_input(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        self.claim(pin, config)
    }

    fn claim_output(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
        self.claim(pin, config)
    }

    fn read(&self, pin: u32) -> Result<u8, GpioError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(pin)
            .map_err(|e| GpioError::Driver(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write(&self, pin: u32, level: u8) -> Result<(), GpioError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
        handle.gpiod_handle.lock().set_level(pin, level)
    }

    fn register_callback(
        &self,
        pin: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId, GpioError> {
        match self.pins.read().get(&pin) {
            Some(handle) if handle.listener.is_some() => {}
            _ => {
                return Err(GpioError::Driver(format!(
                    "GPIO {pin} is not claimed for edge detection"
                )));
            }
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
        let mut pins = self.pins.write();
        let handle = pins
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;

        let line_settings = Self::make_line_settings(&handle.config, micros)?;
        let line_cfg = Self::make_line_config(pin, line_settings)?;
        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Driver(format!("set debounce on GPIO {pin}: {e}")))?;
        Ok(())
    }

    fn tx_pwm(&self, pin: u32, frequency_hz: f64, duty_percent: f64) -> Result<(), GpioError> {
        let mut pins = self.pins.write();
        let handle = pins
            .get_mut(&pin)
            .ok_or_else(|| GpioError::Driver(format!("GPIO {pin} not claimed")))?;
        if handle.config.mode != PinMode::Output {
            return Err(GpioError::Driver(format!("GPIO {pin} is not an output")));
        }

        handle.wave.take();
        if frequency_hz > 0.0 {
            handle.wave = Some(WaveGenerator::new(
                pin,
                handle.gpiod_handle.clone(),
                frequency_hz,
                duty_percent,
            )?);
        }
        Ok(())
    }
}
