use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::GpioError;

const EXPORT_POLL_ATTEMPTS: u32 = 20;
const EXPORT_POLL_DELAY: Duration = Duration::from_millis(5);

/// Per-channel hardware PWM registers, all times in nanoseconds.
///
/// The surface rejects any write leaving `duty_cycle > period`.
pub trait PwmSurface: Send + Sync + 'static {
    fn is_exported(&self, channel: u32) -> bool;
    fn export(&self, channel: u32) -> Result<(), GpioError>;
    fn is_enabled(&self, channel: u32) -> Result<bool, GpioError>;
    fn set_enabled(&self, channel: u32, enabled: bool) -> Result<(), GpioError>;
    fn period(&self, channel: u32) -> Result<u64, GpioError>;
    fn duty_cycle(&self, channel: u32) -> Result<u64, GpioError>;
    fn set_period(&self, channel: u32, period_ns: u64) -> Result<(), GpioError>;
    fn set_duty_cycle(&self, channel: u32, duty_ns: u64) -> Result<(), GpioError>;
}

/// `/sys/class/pwm/pwmchipN` style control surface.
pub struct SysfsPwmChip {
    root: PathBuf,
}

impl SysfsPwmChip {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn channel_path(&self, channel: u32) -> PathBuf {
        self.root.join(format!("pwm{channel}"))
    }

    fn attr(&self, channel: u32, name: &str) -> PathBuf {
        self.channel_path(channel).join(name)
    }

    fn read_u64(path: &Path) -> Result<u64, GpioError> {
        let text = fs::read_to_string(path)
            .map_err(|e| GpioError::Driver(format!("read {}: {e}", path.display())))?;
        text.trim()
            .parse()
            .map_err(|e| GpioError::Driver(format!("parse {}: {e}", path.display())))
    }

    fn write_u64(path: &Path, value: u64) -> Result<(), GpioError> {
        fs::write(path, value.to_string())
            .map_err(|e| GpioError::Driver(format!("write {} to {}: {e}", value, path.display())))
    }
}

impl PwmSurface for SysfsPwmChip {
    fn is_exported(&self, channel: u32) -> bool {
        self.channel_path(channel).exists()
    }

    fn export(&self, channel: u32) -> Result<(), GpioError> {
        Self::write_u64(&self.root.join("export"), channel as u64)?;
        // the kernel creates the channel directory asynchronously
        for _ in 0..EXPORT_POLL_ATTEMPTS {
            if self.is_exported(channel) {
                debug!("exported PWM channel {channel} on {}", self.root.display());
                return Ok(());
            }
            thread::sleep(EXPORT_POLL_DELAY);
        }
        Err(GpioError::Driver(format!(
            "PWM channel {channel} did not appear under {}",
            self.root.display()
        )))
    }

    fn is_enabled(&self, channel: u32) -> Result<bool, GpioError> {
        Ok(Self::read_u64(&self.attr(channel, "enable"))? != 0)
    }

    fn set_enabled(&self, channel: u32, enabled: bool) -> Result<(), GpioError> {
        Self::write_u64(&self.attr(channel, "enable"), enabled as u64)
    }

    fn period(&self, channel: u32) -> Result<u64, GpioError> {
        Self::read_u64(&self.attr(channel, "period"))
    }

    fn duty_cycle(&self, channel: u32) -> Result<u64, GpioError> {
        Self::read_u64(&self.attr(channel, "duty_cycle"))
    }

    fn set_period(&self, channel: u32, period_ns: u64) -> Result<(), GpioError> {
        Self::write_u64(&self.attr(channel, "period"), period_ns)
    }

    fn set_duty_cycle(&self, channel: u32, duty_ns: u64) -> Result<(), GpioError> {
        Self::write_u64(&self.attr(channel, "duty_cycle"), duty_ns)
    }
}

/// Disables `channel` and, for `Some((period, duty))`, reprograms and
/// re-enables it.
///
/// Period and duty are written in whichever order keeps `duty <= period`
/// after every single write: a shrinking period gets its duty first, a duty
/// larger than the current period gets its period first.
pub fn program_channel<S: PwmSurface + ?Sized>(
    surface: &S,
    channel: u32,
    target: Option<(u64, u64)>,
) -> Result<(), GpioError> {
    if surface.is_enabled(channel)? {
        surface.set_enabled(channel, false)?;
    }
    let Some((period_ns, duty_ns)) = target else {
        return Ok(());
    };

    let current_period = surface.period(channel)?;
    let current_duty = surface.duty_cycle(channel)?;

    let duty_first = current_duty > period_ns;
    if duty_first {
        surface.set_duty_cycle(channel, duty_ns)?;
    }
    let period_first = duty_ns > current_period;
    if period_first {
        surface.set_period(channel, period_ns)?;
    }
    if !duty_first {
        surface.set_duty_cycle(channel, duty_ns)?;
    }
    if !period_first {
        surface.set_period(channel, period_ns)?;
    }

    surface.set_enabled(channel, true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Op {
        Export,
        Enable(bool),
        Period(u64),
        Duty(u64),
    }

    #[derive(Default, Clone, Copy)]
    struct Regs {
        enabled: bool,
        period: u64,
        duty: u64,
    }

    /// In-memory surface that enforces `duty <= period` like the kernel does.
    #[derive(Default)]
    pub(crate) struct RecordingSurface {
        regs: Mutex<FxHashMap<u32, Regs>>,
        ops: Mutex<Vec<(u32, Op)>>,
        unreadable_period: AtomicBool,
    }

    impl RecordingSurface {
        pub(crate) fn with_channel(channel: u32, period: u64, duty: u64, enabled: bool) -> Self {
            let surface = Self::default();
            surface.regs.lock().insert(
                channel,
                Regs {
                    enabled,
                    period,
                    duty,
                },
            );
            surface
        }

        /// Makes every later `period` read fail, as an unreadable attribute would.
        pub(crate) fn break_period_reads(&self) {
            self.unreadable_period.store(true, Ordering::Relaxed);
        }

        pub(crate) fn ops(&self) -> Vec<(u32, Op)> {
            self.ops.lock().clone()
        }

        pub(crate) fn state(&self, channel: u32) -> Option<(bool, u64, u64)> {
            self.regs
                .lock()
                .get(&channel)
                .map(|r| (r.enabled, r.period, r.duty))
        }

        fn with_regs<T>(
            &self,
            channel: u32,
            f: impl FnOnce(&mut Regs) -> Result<T, GpioError>,
        ) -> Result<T, GpioError> {
            let mut regs = self.regs.lock();
            let regs = regs
                .get_mut(&channel)
                .ok_or_else(|| GpioError::Driver(format!("pwm{channel} not exported")))?;
            f(regs)
        }
    }

    impl PwmSurface for RecordingSurface {
        fn is_exported(&self, channel: u32) -> bool {
            self.regs.lock().contains_key(&channel)
        }

        fn export(&self, channel: u32) -> Result<(), GpioError> {
            self.ops.lock().push((channel, Op::Export));
            self.regs.lock().entry(channel).or_default();
            Ok(())
        }

        fn is_enabled(&self, channel: u32) -> Result<bool, GpioError> {
            self.with_regs(channel, |r| Ok(r.enabled))
        }

        fn set_enabled(&self, channel: u32, enabled: bool) -> Result<(), GpioError> {
            self.ops.lock().push((channel, Op::Enable(enabled)));
            self.with_regs(channel, |r| {
                r.enabled = enabled;
                Ok(())
            })
        }

        fn period(&self, channel: u32) -> Result<u64, GpioError> {
            if self.unreadable_period.load(Ordering::Relaxed) {
                return Err(GpioError::Driver(format!("read pwm{channel}/period: denied")));
            }
            self.with_regs(channel, |r| Ok(r.period))
        }

        fn duty_cycle(&self, channel: u32) -> Result<u64, GpioError> {
            self.with_regs(channel, |r| Ok(r.duty))
        }

        fn set_period(&self, channel: u32, period_ns: u64) -> Result<(), GpioError> {
            self.ops.lock().push((channel, Op::Period(period_ns)));
            self.with_regs(channel, |r| {
                if r.duty > period_ns {
                    return Err(GpioError::Driver(format!(
                        "period {period_ns} below duty {}",
                        r.duty
                    )));
                }
                r.period = period_ns;
                Ok(())
            })
        }

        fn set_duty_cycle(&self, channel: u32, duty_ns: u64) -> Result<(), GpioError> {
            self.ops.lock().push((channel, Op::Duty(duty_ns)));
            self.with_regs(channel, |r| {
                if duty_ns > r.period {
                    return Err(GpioError::Driver(format!(
                        "duty {duty_ns} above period {}",
                        r.period
                    )));
                }
                r.duty = duty_ns;
                Ok(())
            })
        }
    }

    fn temp_chip(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gpiotrace-pwm-{tag}-{}-{}",
            std::process::id(),
            crate::event_log::epoch_nanos()
        ));
        fs::create_dir_all(&dir).expect("create chip dir");
        fs::write(dir.join("export"), "").expect("export attr");
        dir
    }

    #[test]
    fn shrinking_period_writes_duty_first() {
        let surface = RecordingSurface::with_channel(2, 1000, 800, true);
        program_channel(&surface, 2, Some((500, 400))).expect("program");
        assert_eq!(
            surface.ops(),
            vec![
                (2, Op::Enable(false)),
                (2, Op::Duty(400)),
                (2, Op::Period(500)),
                (2, Op::Enable(true)),
            ]
        );
        assert_eq!(surface.state(2), Some((true, 500, 400)));
    }

    #[test]
    fn growing_duty_writes_period_first() {
        let surface = RecordingSurface::with_channel(3, 500, 100, false);
        program_channel(&surface, 3, Some((2000, 1500))).expect("program");
        assert_eq!(
            surface.ops(),
            vec![(3, Op::Period(2000)), (3, Op::Duty(1500)), (3, Op::Enable(true))]
        );
        assert_eq!(surface.state(3), Some((true, 2000, 1500)));
    }

    #[test]
    fn fresh_channel_is_programmed_from_zero() {
        let surface = RecordingSurface::with_channel(2, 0, 0, false);
        program_channel(&surface, 2, Some((500_000, 125_000))).expect("program");
        assert_eq!(surface.state(2), Some((true, 500_000, 125_000)));
    }

    #[test]
    fn no_target_only_disables() {
        let surface = RecordingSurface::with_channel(2, 1000, 500, true);
        program_channel(&surface, 2, None).expect("disable");
        assert_eq!(surface.ops(), vec![(2, Op::Enable(false))]);
        assert_eq!(surface.state(2), Some((false, 1000, 500)));
    }

    #[test]
    fn every_transition_between_settings_is_valid() {
        let settings = [(0, 0), (100, 0), (100, 100), (1000, 10), (50, 25), (10_000, 9_999)];
        for &(cp, cd) in &settings {
            for &(np, nd) in &settings {
                if cd > cp {
                    continue;
                }
                let surface = RecordingSurface::with_channel(0, cp, cd, true);
                program_channel(&surface, 0, Some((np, nd)))
                    .unwrap_or_else(|e| panic!("({cp},{cd}) -> ({np},{nd}): {e}"));
                assert_eq!(surface.state(0), Some((true, np, nd)));
            }
        }
    }

    #[test]
    fn sysfs_reads_and_writes_text_integers() {
        let root = temp_chip("attrs");
        let ch = root.join("pwm2");
        fs::create_dir_all(&ch).expect("channel dir");
        fs::write(ch.join("enable"), "1\n").expect("enable");
        fs::write(ch.join("period"), "1000\n").expect("period");
        fs::write(ch.join("duty_cycle"), "800\n").expect("duty");

        let chip = SysfsPwmChip::new(&root);
        assert!(chip.is_exported(2));
        assert!(!chip.is_exported(3));
        assert!(chip.is_enabled(2).expect("enabled"));

        program_channel(&chip, 2, Some((500, 400))).expect("program");
        assert_eq!(chip.period(2).expect("period"), 500);
        assert_eq!(chip.duty_cycle(2).expect("duty"), 400);
        assert_eq!(fs::read_to_string(ch.join("enable")).expect("enable"), "1");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn export_fails_when_channel_never_appears() {
        let root = temp_chip("export");
        let chip = SysfsPwmChip::new(&root);
        assert!(matches!(chip.export(3), Err(GpioError::Driver(_))));
        assert_eq!(fs::read_to_string(root.join("export")).expect("export"), "3");
        let _ = fs::remove_dir_all(root);
    }
}
