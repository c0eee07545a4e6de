use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;

use crate::error::AppError;
use crate::gpio::{Direction, GpioDriver, GpioLine, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PwmState {
    Running,
    Stopped,
}

/// Clamps a requested duty cycle to `[0, 100]`. NaN maps to 0.
pub fn clamp_duty_cycle(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// A refused [`PwmChannel::start`]. The line is handed back unchanged.
#[derive(Error)]
#[error("{error}")]
pub struct PwmStartError {
    error: AppError,
    line: GpioLine,
}

impl PwmStartError {
    pub fn error(&self) -> &AppError {
        &self.error
    }

    pub fn into_line(self) -> GpioLine {
        self.line
    }

    pub fn into_parts(self) -> (AppError, GpioLine) {
        (self.error, self.line)
    }
}

impl fmt::Debug for PwmStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PwmStartError")
            .field("error", &self.error)
            .field("pin", &self.line.pin())
            .finish()
    }
}

impl From<PwmStartError> for AppError {
    fn from(e: PwmStartError) -> Self {
        e.error
    }
}

struct Control {
    duty_cycle: f64,
    stopped: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
}

/// A PWM waveform on an output line.
///
/// When the driver has no PWM peripheral for the pin the waveform is generated
/// in software on a dedicated thread, sampling the duty cycle at the start of
/// every period.
pub struct PwmChannel {
    pin: u32,
    period: Duration,
    hardware: bool,
    driver: Arc<dyn GpioDriver>,
    shared: Arc<Shared>,
    line: Mutex<Option<GpioLine>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PwmChannel {
    /// Takes ownership of `line`. On error the line comes back, still claimed
    /// as a plain line, inside the [`PwmStartError`].
    pub fn start(
        line: GpioLine,
        period: Duration,
        initial_duty_cycle: f64,
    ) -> Result<Self, PwmStartError> {
        let pin = line.pin();
        if line.direction() != Direction::Output {
            let error = AppError::Configuration(format!(
                "pin {pin} is not an output, PWM needs an output line"
            ));
            return Err(PwmStartError { error, line });
        }
        if period.is_zero() {
            let error = AppError::Configuration(format!("pin {pin}: PWM period must be non-zero"));
            return Err(PwmStartError { error, line });
        }
        if let Err(error) = line.registry().promote_to_pwm(pin) {
            return Err(PwmStartError { error, line });
        }

        let driver = line.driver().clone();
        let duty_cycle = clamp_duty_cycle(initial_duty_cycle);
        let (hardware, shared, worker) = match launch(pin, period, duty_cycle, &driver) {
            Ok(launched) => launched,
            Err(error) => {
                line.registry().demote_to_line(pin);
                return Err(PwmStartError { error, line });
            }
        };

        debug!(
            "pin {pin}: PWM started, period {period:?}, duty {duty_cycle}%, {}",
            if hardware { "hardware" } else { "software" }
        );

        Ok(Self {
            pin,
            period,
            hardware,
            driver,
            shared,
            line: Mutex::new(Some(line)),
            worker: Mutex::new(worker),
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_hardware(&self) -> bool {
        self.hardware
    }

    pub fn duty_cycle(&self) -> f64 {
        self.shared.control.lock().duty_cycle
    }

    pub fn state(&self) -> PwmState {
        if self.shared.control.lock().stopped {
            PwmState::Stopped
        } else {
            PwmState::Running
        }
    }

    /// Out-of-range values are clamped; the change applies from the next period.
    pub fn set_duty_cycle(&self, value: f64) -> Result<(), AppError> {
        let mut control = self.shared.control.lock();
        if control.stopped {
            return Err(AppError::InvalidOperation(format!(
                "PWM on pin {} is stopped",
                self.pin
            )));
        }
        let duty_cycle = clamp_duty_cycle(value);
        if self.hardware {
            self.driver.set_pwm_duty_cycle(self.pin, duty_cycle)?;
        }
        control.duty_cycle = duty_cycle;
        Ok(())
    }

    /// Forces the output Low, releases the line and ends the channel.
    ///
    /// Stopping an already stopped channel is a no-op.
    pub fn stop(&self) -> Result<(), AppError> {
        {
            let mut control = self.shared.control.lock();
            if control.stopped {
                return Ok(());
            }
            control.stopped = true;
            control.duty_cycle = 0.0;
            self.shared.wake.notify_all();
        }

        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            warn!("PWM thread for pin {} panicked", self.pin);
        }

        let mut result = Ok(());
        if self.hardware {
            result = self.driver.set_pwm_duty_cycle(self.pin, 0.0);
        }

        if let Some(line) = self.line.lock().take() {
            let low = line.write(Level::Low);
            let released = line.release();
            result = result.and(low).and(released);
        }

        debug!("pin {}: PWM stopped", self.pin);
        result
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("failed to stop PWM on pin {}: {e}", self.pin);
        }
    }
}

type Launched = (bool, Arc<Shared>, Option<JoinHandle<()>>);

fn launch(
    pin: u32,
    period: Duration,
    duty_cycle: f64,
    driver: &Arc<dyn GpioDriver>,
) -> Result<Launched, AppError> {
    let hardware = driver.hardware_pwm(pin, period)?;
    if hardware {
        driver.set_pwm_duty_cycle(pin, duty_cycle)?;
    }

    let shared = Arc::new(Shared {
        control: Mutex::new(Control {
            duty_cycle,
            stopped: false,
        }),
        wake: Condvar::new(),
    });

    let worker = if hardware {
        None
    } else {
        let shared = shared.clone();
        let driver = driver.clone();
        let handle = thread::Builder::new()
            .name(format!("pwm-{pin}"))
            .spawn(move || run_waveform(pin, period, driver, shared))
            .map_err(|e| AppError::Driver(format!("spawn PWM thread for pin {pin}: {e}")))?;
        Some(handle)
    };
    Ok((hardware, shared, worker))
}

fn run_waveform(pin: u32, period: Duration, driver: Arc<dyn GpioDriver>, shared: Arc<Shared>) {
    let mut driven: Option<Level> = None;
    let mut drive = |level: Level| -> Result<(), AppError> {
        if driven != Some(level) {
            driver.write_pin(pin, level)?;
            driven = Some(level);
        }
        Ok(())
    };

    let mut control = shared.control.lock();
    while !control.stopped {
        let period_start = Instant::now();
        let high = period.mul_f64(control.duty_cycle / 100.0);

        if !high.is_zero() {
            if let Err(e) = drive(Level::High) {
                warn!("pin {pin}: software PWM halted: {e}");
                return;
            }
            if !sleep_until(&shared, &mut control, period_start + high) {
                break;
            }
        }
        if high < period {
            if let Err(e) = drive(Level::Low) {
                warn!("pin {pin}: software PWM halted: {e}");
                return;
            }
            if !sleep_until(&shared, &mut control, period_start + period) {
                break;
            }
        }
    }
}

/// Returns `false` when woken by `stop`.
fn sleep_until(shared: &Shared, control: &mut MutexGuard<'_, Control>, deadline: Instant) -> bool {
    while !control.stopped {
        if shared.wake.wait_until(control, deadline).timed_out() {
            return !control.stopped;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, MockDriver};
    use crate::gpio::{Gpio, PinOwner, Pull};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn clamps_duty_cycle() {
        assert_eq!(clamp_duty_cycle(-5.0), 0.0);
        assert_eq!(clamp_duty_cycle(40.0), 40.0);
        assert_eq!(clamp_duty_cycle(150.0), 100.0);
        assert_eq!(clamp_duty_cycle(f64::NAN), 0.0);
        assert_eq!(clamp_duty_cycle(f64::INFINITY), 100.0);
    }

    #[test]
    fn start_requires_output_and_returns_the_line() {
        let driver = Arc::new(MockDriver::default());
        let gpio = Gpio::new(driver);
        let input = gpio.configure(19, Direction::Input, Pull::None).unwrap();
        let err = PwmChannel::start(input, ms(20), 40.0).err().unwrap();
        assert!(err.error().is_configuration());

        let input = err.into_line();
        assert_eq!(input.direction(), Direction::Input);
        assert_eq!(gpio.registry().owner(19), Some(PinOwner::Line));
        assert_eq!(input.read().unwrap(), Level::Low);
        drop(input);
        assert!(gpio.claimed_pins().is_empty());
    }

    #[test]
    fn zero_period_hands_back_a_reusable_line() {
        let driver = Arc::new(MockDriver::default());
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(19, Direction::Output, Pull::None).unwrap();
        let (error, line) = PwmChannel::start(line, Duration::ZERO, 40.0)
            .err()
            .unwrap()
            .into_parts();
        assert!(error.is_configuration());
        assert!(driver.duty_cycles(19).is_empty());

        let pwm = PwmChannel::start(line, ms(20), 40.0).unwrap();
        assert_eq!(gpio.registry().owner(19), Some(PinOwner::Pwm));
        assert_eq!(driver.duty_cycles(19), vec![40.0]);
        pwm.stop().unwrap();
    }

    #[test]
    fn driver_refusal_keeps_the_line_claimed() {
        let driver = Arc::new(MockDriver::default());
        driver.fail_pwm(19);
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(19, Direction::Output, Pull::None).unwrap();

        let err = PwmChannel::start(line, ms(20), 40.0).err().unwrap();
        assert!(matches!(err.error(), AppError::Driver(_)));
        assert_eq!(gpio.registry().owner(19), Some(PinOwner::Line));

        let line = err.into_line();
        line.write(Level::High).unwrap();
        assert_eq!(driver.level(19), Some(Level::High));
    }

    #[test]
    fn hardware_channel_forwards_duty_changes() {
        let driver = Arc::new(MockDriver::default());
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(19, Direction::Output, Pull::None).unwrap();
        let pwm = PwmChannel::start(line, ms(20), 40.0).unwrap();
        assert!(pwm.is_hardware());
        assert_eq!(gpio.registry().owner(19), Some(PinOwner::Pwm));

        pwm.set_duty_cycle(120.0).unwrap();
        assert_eq!(pwm.duty_cycle(), 100.0);
        pwm.set_duty_cycle(2.5).unwrap();
        assert_eq!(driver.duty_cycles(19), vec![40.0, 100.0, 2.5]);
    }

    #[test]
    fn stop_is_terminal() {
        let driver = Arc::new(MockDriver::default());
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(12, Direction::Output, Pull::None).unwrap();
        let pwm = PwmChannel::start(line, ms(1), 50.0).unwrap();

        pwm.stop().unwrap();
        assert_eq!(pwm.state(), PwmState::Stopped);
        assert_eq!(pwm.duty_cycle(), 0.0);
        assert!(pwm.set_duty_cycle(10.0).unwrap_err().is_invalid_operation());
        pwm.stop().unwrap();
        assert!(gpio.claimed_pins().is_empty());
        assert_eq!(driver.calls().last(), Some(&DriverCall::Release(12)));
    }

    #[test]
    fn software_waveform_toggles_line() {
        let driver = Arc::new(MockDriver::without_hardware_pwm());
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(19, Direction::Output, Pull::None).unwrap();
        let pwm = PwmChannel::start(line, ms(4), 50.0).unwrap();
        assert!(!pwm.is_hardware());

        thread::sleep(ms(40));
        pwm.stop().unwrap();

        let writes = driver.writes(19);
        assert!(writes.len() >= 4, "expected a toggling waveform, got {writes:?}");
        assert_eq!(writes.first(), Some(&Level::High));
        assert_eq!(writes.last(), Some(&Level::Low));
        // every write from the waveform itself is a level change
        let waveform = &writes[..writes.len() - 1];
        assert!(waveform.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(driver.level(19), None);
    }

    #[test]
    fn software_waveform_extremes_hold_level() {
        let driver = Arc::new(MockDriver::without_hardware_pwm());
        let gpio = Gpio::new(driver.clone());
        let line = gpio.configure(19, Direction::Output, Pull::None).unwrap();
        let pwm = PwmChannel::start(line, ms(2), 100.0).unwrap();
        thread::sleep(ms(20));
        assert_eq!(driver.writes(19), vec![Level::High]);

        pwm.set_duty_cycle(0.0).unwrap();
        thread::sleep(ms(20));
        assert_eq!(driver.writes(19), vec![Level::High, Level::Low]);
        drop(pwm);
        assert!(gpio.claimed_pins().is_empty());
    }
}
