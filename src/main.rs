use log::info;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use gpiotrace::{
    Bias, Edge, GpioConfig, GpioController, GpioError, PinConfig, SysfsPwmChip,
};

#[cfg(feature = "hardware-gpio")]
use gpiotrace::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use gpiotrace::MockLineDriver;

const INPUT_PIN: u32 = 4;
const OUTPUT_PIN: u32 = 5;
const HARDWARE_PWM_PIN: u32 = 18;
const STEP: Duration = Duration::from_secs(5);

fn main() -> Result<(), GpioError> {
    env_logger::init();

    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOTRACE_CONFIG").ok())
    {
        Some(path) => GpioConfig::load_from_file(&path)?,
        None => GpioConfig::default(),
    };

    let driver = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(LibgpiodBackend::new(config.chip.clone())?)
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockLineDriver::default())
        }
    };
    let surface = Arc::new(SysfsPwmChip::new(&config.hardware_pwm.chip_path));

    info!("Streaming pin activity to {}...", config.log_pipe.display());
    let gpio = GpioController::new(config, driver, surface)?;

    gpio.set_mode(INPUT_PIN, PinConfig::input().bias(Bias::PullUp))?;
    gpio.set_mode(OUTPUT_PIN, PinConfig::output())?;

    info!("GPIO {INPUT_PIN} reads {}", gpio.read(INPUT_PIN)?);
    gpio.write(OUTPUT_PIN, 1)?;

    let rising = gpio.add_callback(INPUT_PIN, Edge::Rising, |event| {
        info!("Rising edge detected on GPIO {}", event.pin);
    })?;
    let falling = gpio.add_callback(INPUT_PIN, Edge::Falling, |event| {
        info!("Falling edge detected on GPIO {}", event.pin);
    })?;

    gpio.software_pwm(OUTPUT_PIN, 50.0, 75.0)?;
    sleep(STEP);
    gpio.software_pwm(OUTPUT_PIN, 100.0, 50.0)?;
    sleep(STEP);
    gpio.software_pwm(OUTPUT_PIN, 0.0, 0.0)?;

    gpio.hardware_pwm(HARDWARE_PWM_PIN, 2000.0, 25.0)?;
    sleep(STEP);
    gpio.hardware_pwm(HARDWARE_PWM_PIN, 5000.0, 75.0)?;
    sleep(STEP);
    gpio.hardware_pwm(HARDWARE_PWM_PIN, 0.0, 0.0)?;

    rising.cancel();
    falling.cancel();
    gpio.close();

    Ok(())
}
