mod backend;
mod callback;
mod config;
mod error;
mod event_log;
mod gpio;
mod pwm;
mod registry;

pub use callback::{CallbackDispatcher, CallbackHandle};
pub use config::{Bias, Edge, GpioConfig, HardwarePwmConfig, PinConfig, PinMode};
pub use error::{GpioError, ModeState, WorkerFault, WorkerKind};
pub use event_log::{EventLog, LogEvent, PipeTransport};
pub use gpio::{
    CallbackId, EdgeCallback, EdgeEvent, GenericGpioController, GpioController, LineDriver,
};
pub use pwm::{
    PwmChannelState, PwmController, PwmKind, PwmSurface, SysfsPwmChip, half_periods,
    hardware_timing, program_channel,
};
pub use registry::PinRegistry;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockLineDriver;
