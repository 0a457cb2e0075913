use log::{debug, info};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::callback::input_sink;
use crate::config::{Edge, HardwarePwmConfig, PinConfig, PinMode};
use crate::error::GpioError;
use crate::event_log::EventLog;
use crate::gpio::{CallbackId, EdgeCallback, LineDriver};

struct PinEntry {
    config: PinConfig,
    log_sink: Option<CallbackId>,
    // application callbacks, valid only while the pin is an input
    observers: Vec<CallbackId>,
}

impl PinEntry {
    fn new(config: PinConfig) -> Self {
        Self {
            config,
            log_sink: None,
            observers: Vec::new(),
        }
    }
}

/// Authoritative record of how each pin is claimed.
///
/// Reconfiguration is serialised by its own lock; the pin map is only
/// locked to read or update entries, never across a driver call.
pub struct PinRegistry<D: LineDriver> {
    driver: Arc<D>,
    log: Arc<EventLog>,
    hardware_pwm: HardwarePwmConfig,
    configuring: Mutex<()>,
    pins: RwLock<FxHashMap<u32, PinEntry>>,
}

impl<D: LineDriver> PinRegistry<D> {
    pub fn new(driver: Arc<D>, log: Arc<EventLog>, hardware_pwm: HardwarePwmConfig) -> Self {
        Self {
            driver,
            log,
            hardware_pwm,
            configuring: Mutex::new(()),
            pins: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn is_reserved(&self, pin: u32) -> bool {
        self.hardware_pwm.is_reserved(pin)
    }

    /// Claims the line, then records the mode. A failed claim leaves the
    /// previous record untouched. Leaving input mode cancels every
    /// application callback on the pin.
    pub fn configure(&self, pin: u32, config: PinConfig) -> Result<(), GpioError> {
        if self.is_reserved(pin) {
            return Err(GpioError::ReservedPin(pin));
        }
        config.validate()?;

        let _configuring = self.configuring.lock();
        match config.mode {
            PinMode::Input => self.driver.claim_input(pin, &config)?,
            PinMode::Output => self.driver.claim_output(pin, &config)?,
        }

        let previous = self.pins.write().insert(pin, PinEntry::new(config.clone()));
        let (old_sink, mut observers) =
            previous.map_or((None, Vec::new()), |old| (old.log_sink, old.observers));
        // the previous input sink would double-log once the new one is in
        if let Some(id) = old_sink {
            self.driver.cancel_callback(id);
        }

        let log_sink = match config.mode {
            PinMode::Input => match self.attach_input(pin, &config) {
                Ok(id) => Some(id),
                Err(e) => {
                    if let Some(entry) = self.pins.write().remove(&pin) {
                        observers.extend(entry.observers);
                    }
                    self.cancel_observers(pin, &observers);
                    return Err(e);
                }
            },
            PinMode::Output => {
                self.cancel_observers(pin, &observers);
                observers.clear();
                None
            }
        };

        if let Some(entry) = self.pins.write().get_mut(&pin) {
            entry.log_sink = log_sink;
            entry.observers.extend(observers);
        }
        info!("GPIO {pin} configured as {}", config.mode);
        Ok(())
    }

    fn attach_input(&self, pin: u32, config: &PinConfig) -> Result<CallbackId, GpioError> {
        if config.debounce_micros > 0 {
            self.driver.set_debounce(pin, config.debounce_micros)?;
        }
        self.driver
            .register_callback(pin, Edge::Both, input_sink(self.log.clone()))
    }

    fn cancel_observers(&self, pin: u32, observers: &[CallbackId]) {
        if observers.is_empty() {
            return;
        }
        for id in observers {
            self.driver.cancel_callback(*id);
        }
        debug!("GPIO {pin}: cancelled {} callbacks", observers.len());
    }

    /// Registers an application callback on an input pin.
    pub fn attach_observer(
        &self,
        pin: u32,
        edge: Edge,
        callback: EdgeCallback,
    ) -> Result<CallbackId, GpioError> {
        self.require(pin, PinMode::Input)?;
        let id = self.driver.register_callback(pin, edge, callback)?;

        // the pin may have left input mode while the driver was registering
        let mut pins = self.pins.write();
        match pins.get_mut(&pin) {
            Some(entry) if entry.config.mode == PinMode::Input => {
                entry.observers.push(id);
                Ok(id)
            }
            entry => {
                let actual = entry.map(|e| e.config.mode);
                self.driver.cancel_callback(id);
                Err(GpioError::mode(pin, PinMode::Input, actual))
            }
        }
    }

    /// Cancels one application callback. Unknown ids are ignored.
    pub fn detach_observer(&self, pin: u32, id: CallbackId) {
        if let Some(entry) = self.pins.write().get_mut(&pin) {
            entry.observers.retain(|o| *o != id);
        }
        self.driver.cancel_callback(id);
    }

    pub fn observer_count(&self, pin: u32) -> usize {
        self.pins
            .read()
            .get(&pin)
            .map_or(0, |entry| entry.observers.len())
    }

    pub fn mode_of(&self, pin: u32) -> Option<PinMode> {
        self.pins.read().get(&pin).map(|entry| entry.config.mode)
    }

    pub fn config_of(&self, pin: u32) -> Option<PinConfig> {
        self.pins.read().get(&pin).map(|entry| entry.config.clone())
    }

    /// Fails with a mode error unless `pin` is currently in `mode`.
    pub fn require(&self, pin: u32, mode: PinMode) -> Result<(), GpioError> {
        match self.mode_of(pin) {
            Some(actual) if actual == mode => Ok(()),
            actual => Err(GpioError::mode(pin, mode, actual)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLineDriver;
    use crate::config::Bias;
    use crate::error::ModeState;
    use crate::gpio::EdgeEvent;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak, mpsc};
    use std::thread;
    use std::time::Duration;

    fn registry(driver: Arc<MockLineDriver>) -> (PinRegistry<MockLineDriver>, Arc<EventLog>) {
        let log = Arc::new(EventLog::new(100));
        let reg = PinRegistry::new(driver, log.clone(), HardwarePwmConfig::default());
        (reg, log)
    }

    #[test]
    fn reserved_pins_reject_every_mode() {
        let (reg, _) = registry(Arc::new(MockLineDriver::default()));
        for pin in [18, 19] {
            for cfg in [
                PinConfig::input(),
                PinConfig::input().bias(Bias::PullUp),
                PinConfig::output(),
                PinConfig::output().initial_level(1).open_drain(true),
            ] {
                assert!(matches!(
                    reg.configure(pin, cfg),
                    Err(GpioError::ReservedPin(p)) if p == pin
                ));
            }
            assert_eq!(reg.mode_of(pin), None);
        }
    }

    #[test]
    fn failed_claim_records_nothing() {
        let driver = Arc::new(MockLineDriver::with_unavailable([7]));
        let (reg, _) = registry(driver);
        assert!(matches!(
            reg.configure(7, PinConfig::output()),
            Err(GpioError::Driver(_))
        ));
        assert_eq!(reg.mode_of(7), None);
    }

    #[test]
    fn input_sink_logs_every_transition() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, log) = registry(driver.clone());
        reg.configure(4, PinConfig::input()).expect("configure");

        driver.inject_level(4, 1).expect("inject");
        driver.inject_level(4, 0).expect("inject");

        let events = log.drain();
        let levels: Vec<u8> = events.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![1, 0]);
        assert!(events.iter().all(|e| e.pin == 4));
    }

    #[test]
    fn reconfigure_replaces_input_sink() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, log) = registry(driver.clone());
        reg.configure(4, PinConfig::input()).expect("first");
        reg.configure(4, PinConfig::input().bias(Bias::PullDown))
            .expect("second");
        assert_eq!(driver.callback_count(4), 1);

        driver.inject_level(4, 1).expect("inject");
        assert_eq!(log.len(), 1);

        reg.configure(4, PinConfig::output()).expect("to output");
        assert_eq!(driver.callback_count(4), 0);
        assert_eq!(reg.mode_of(4), Some(PinMode::Output));
    }

    fn counting_callback(hits: &Arc<AtomicUsize>) -> EdgeCallback {
        let hits = hits.clone();
        Arc::new(move |_: EdgeEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn leaving_input_cancels_application_callbacks() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, _) = registry(driver.clone());
        reg.configure(4, PinConfig::input()).expect("input");
        let hits = Arc::new(AtomicUsize::new(0));
        reg.attach_observer(4, Edge::Both, counting_callback(&hits))
            .expect("observer");
        assert_eq!(reg.observer_count(4), 1);

        reg.configure(4, PinConfig::output()).expect("to output");
        assert_eq!(driver.callback_count(4), 0);
        assert_eq!(reg.observer_count(4), 0);

        reg.configure(4, PinConfig::input()).expect("back to input");
        driver.inject_level(4, 1).expect("inject");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // only the log sink is left
        assert_eq!(driver.callback_count(4), 1);
    }

    #[test]
    fn input_reconfigure_keeps_application_callbacks() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, _) = registry(driver.clone());
        reg.configure(4, PinConfig::input()).expect("input");
        let hits = Arc::new(AtomicUsize::new(0));
        reg.attach_observer(4, Edge::Rising, counting_callback(&hits))
            .expect("observer");

        reg.configure(4, PinConfig::input().bias(Bias::PullDown))
            .expect("reconfigure");
        assert_eq!(reg.observer_count(4), 1);
        driver.inject_level(4, 1).expect("inject");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_need_an_input_pin() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, _) = registry(driver.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            reg.attach_observer(4, Edge::Both, counting_callback(&hits)),
            Err(GpioError::Mode { .. })
        ));
        reg.configure(4, PinConfig::output()).expect("output");
        assert!(matches!(
            reg.attach_observer(4, Edge::Both, counting_callback(&hits)),
            Err(GpioError::Mode { .. })
        ));
        assert_eq!(driver.callback_count(4), 0);
    }

    /// Mock whose claim waits on another thread reading the registry, the way
    /// a hardware driver joins a listener that is inside a callback. Claims
    /// can also be refused outright.
    #[derive(Default)]
    struct ReadDuringClaim {
        inner: MockLineDriver,
        registry: OnceLock<Weak<PinRegistry<ReadDuringClaim>>>,
        reads: AtomicUsize,
        refuse_claims: AtomicBool,
    }

    impl ReadDuringClaim {
        fn before_claim(&self, pin: u32) -> Result<(), GpioError> {
            if self.refuse_claims.load(Ordering::SeqCst) {
                return Err(GpioError::Driver(format!("reconfigure GPIO {pin}: busy")));
            }
            let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
                return Ok(());
            };
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let _ = tx.send(registry.mode_of(pin));
            });
            if rx.recv_timeout(Duration::from_secs(2)).is_ok() {
                self.reads.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    impl LineDriver for ReadDuringClaim {
        fn claim_input(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
            self.before_claim(pin)?;
            self.inner.claim_input(pin, config)
        }
        fn claim_output(&self, pin: u32, config: &PinConfig) -> Result<(), GpioError> {
            self.before_claim(pin)?;
            self.inner.claim_output(pin, config)
        }
        fn read(&self, pin: u32) -> Result<u8, GpioError> {
            self.inner.read(pin)
        }
        fn write(&self, pin: u32, level: u8) -> Result<(), GpioError> {
            self.inner.write(pin, level)
        }
        fn register_callback(
            &self,
            pin: u32,
            edge: Edge,
            callback: EdgeCallback,
        ) -> Result<CallbackId, GpioError> {
            self.inner.register_callback(pin, edge, callback)
        }
        fn cancel_callback(&self, id: CallbackId) {
            self.inner.cancel_callback(id)
        }
        fn set_debounce(&self, pin: u32, micros: u32) -> Result<(), GpioError> {
            self.inner.set_debounce(pin, micros)
        }
        fn tx_pwm(&self, pin: u32, frequency_hz: f64, duty_percent: f64) -> Result<(), GpioError> {
            self.inner.tx_pwm(pin, frequency_hz, duty_percent)
        }
    }

    #[test]
    fn registry_stays_readable_while_the_driver_claims() {
        let driver = Arc::new(ReadDuringClaim::default());
        let reg = Arc::new(PinRegistry::new(
            driver.clone(),
            Arc::new(EventLog::new(100)),
            HardwarePwmConfig::default(),
        ));
        let _ = driver.registry.set(Arc::downgrade(&reg));

        reg.configure(4, PinConfig::input()).expect("first claim");
        reg.configure(4, PinConfig::output()).expect("reclaim");
        assert_eq!(driver.reads.load(Ordering::SeqCst), 2);
        assert_eq!(reg.mode_of(4), Some(PinMode::Output));
    }

    #[test]
    fn failed_reclaim_keeps_pin_and_callbacks() {
        let driver = Arc::new(ReadDuringClaim::default());
        let reg = PinRegistry::new(
            driver.clone(),
            Arc::new(EventLog::new(100)),
            HardwarePwmConfig::default(),
        );
        reg.configure(4, PinConfig::input()).expect("input");
        let hits = Arc::new(AtomicUsize::new(0));
        reg.attach_observer(4, Edge::Both, counting_callback(&hits))
            .expect("observer");

        driver.refuse_claims.store(true, Ordering::SeqCst);
        assert!(matches!(
            reg.configure(4, PinConfig::output()),
            Err(GpioError::Driver(_))
        ));
        assert_eq!(reg.mode_of(4), Some(PinMode::Input));
        assert_eq!(reg.observer_count(4), 1);

        driver.inner.inject_level(4, 1).expect("inject");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(driver.inner.callback_count(4), 2);
    }

    #[test]
    fn require_reports_actual_mode() {
        let (reg, _) = registry(Arc::new(MockLineDriver::default()));
        match reg.require(3, PinMode::Output) {
            Err(GpioError::Mode { actual, .. }) => assert_eq!(actual, ModeState::Unconfigured),
            other => panic!("unexpected {other:?}"),
        }
        reg.configure(3, PinConfig::input()).expect("configure");
        match reg.require(3, PinMode::Output) {
            Err(GpioError::Mode { actual, .. }) => {
                assert_eq!(actual, ModeState::Configured(PinMode::Input))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reg.require(3, PinMode::Input).is_ok());
    }

    #[test]
    fn debounce_is_forwarded_to_driver() {
        let driver = Arc::new(MockLineDriver::default());
        let (reg, _) = registry(driver.clone());
        reg.configure(6, PinConfig::input().debounce_micros(500))
            .expect("configure");
        assert_eq!(driver.debounce_of(6), Some(500));
    }
}
