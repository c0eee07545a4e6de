use std::ops::Not;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_bit(value: u8) -> Result<Self, AppError> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            _ => Err(AppError::InvalidValue("Value must be 0 or 1".into())),
        }
    }

    pub fn as_bit(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pull {
    #[default]
    None,
    PullUp,
    PullDown,
}

/// Which transitions an edge subscription reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Rising,
    Falling,
    Both,
}

impl Trigger {
    pub fn matches(self, edge: Edge) -> bool {
        match self {
            Trigger::Rising => edge == Edge::Rising,
            Trigger::Falling => edge == Edge::Falling,
            Trigger::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn between(old: Level, new: Level) -> Option<Edge> {
        match (old, new) {
            (Level::Low, Level::High) => Some(Edge::Rising),
            (Level::High, Level::Low) => Some(Edge::Falling),
            _ => None,
        }
    }
}

/// A single transition observed by the driver.
///
/// `timestamp` is monotonic but its epoch is driver defined; only differences
/// between timestamps of the same pin are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: u32,
    pub edge: Edge,
    pub timestamp: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatcherFault {
    #[error("edge subscription on pin {pin} lost: {reason}")]
    SubscriptionLost { pin: u32, reason: String },
    #[error("edge handler on pin {pin} panicked")]
    HandlerPanicked { pin: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeNotification {
    Edge(EdgeEvent),
    Fault(WatcherFault),
}

pub type EdgeCallback = Arc<dyn Fn(EdgeNotification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Hardware access layer used by lines, watchers and PWM channels.
///
/// Callbacks passed to [`GpioDriver::subscribe_edge`] may run on any thread
/// owned by the driver and must not be invoked while the driver holds
/// internal locks.
pub trait GpioDriver: Send + Sync {
    fn configure_pin(&self, pin: u32, direction: Direction, pull: Pull) -> Result<(), AppError>;

    /// Edge subscriptions still open on `pin` are dropped and each callback
    /// receives [`WatcherFault::SubscriptionLost`] once, after the pin is gone.
    fn release_pin(&self, pin: u32) -> Result<(), AppError>;
    fn read_pin(&self, pin: u32) -> Result<Level, AppError>;
    fn write_pin(&self, pin: u32, level: Level) -> Result<(), AppError>;
    fn subscribe_edge(
        &self,
        pin: u32,
        trigger: Trigger,
        callback: EdgeCallback,
    ) -> Result<SubscriptionHandle, AppError>;
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), AppError>;

    /// Returns `true` when the driver generates the waveform for `pin` itself.
    fn hardware_pwm(&self, _pin: u32, _period: Duration) -> Result<bool, AppError> {
        Ok(false)
    }

    fn set_pwm_duty_cycle(&self, pin: u32, _percent: f64) -> Result<(), AppError> {
        Err(AppError::Driver(format!(
            "hardware PWM not available on pin {pin}"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinOwner {
    Line,
    Pwm,
}

/// Tracks which pins are claimed and by what.
#[derive(Default)]
pub struct PinRegistry {
    claims: Mutex<FxHashMap<u32, PinOwner>>,
}

impl PinRegistry {
    fn claim(&self, pin: u32, owner: PinOwner) -> Result<(), AppError> {
        let mut claims = self.claims.lock();
        if let Some(current) = claims.get(&pin) {
            return Err(AppError::Configuration(format!(
                "pin {pin} is already claimed by {current:?}"
            )));
        }
        claims.insert(pin, owner);
        debug!("pin {pin} claimed by {owner:?}");
        Ok(())
    }

    pub(crate) fn promote_to_pwm(&self, pin: u32) -> Result<(), AppError> {
        let mut claims = self.claims.lock();
        match claims.get(&pin).copied() {
            Some(PinOwner::Line) => {
                claims.insert(pin, PinOwner::Pwm);
                debug!("pin {pin} handed over to PWM");
                Ok(())
            }
            Some(PinOwner::Pwm) => Err(AppError::Configuration(format!(
                "pin {pin} is already owned by a PWM channel"
            ))),
            None => Err(AppError::Configuration(format!("pin {pin} is not claimed"))),
        }
    }

    pub(crate) fn demote_to_line(&self, pin: u32) {
        if let Some(owner) = self.claims.lock().get_mut(&pin) {
            *owner = PinOwner::Line;
        }
    }

    fn release(&self, pin: u32) -> Option<PinOwner> {
        let owner = self.claims.lock().remove(&pin);
        if let Some(owner) = owner {
            debug!("pin {pin} released by {owner:?}");
        }
        owner
    }

    pub fn owner(&self, pin: u32) -> Option<PinOwner> {
        self.claims.lock().get(&pin).copied()
    }

    pub fn claimed(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.claims.lock().keys().copied().collect();
        pins.sort_unstable();
        pins
    }
}

/// Entry point: a driver plus the registry of pins claimed through it.
#[derive(Clone)]
pub struct Gpio {
    driver: Arc<dyn GpioDriver>,
    registry: Arc<PinRegistry>,
}

impl Gpio {
    pub fn new(driver: Arc<dyn GpioDriver>) -> Self {
        Self {
            driver,
            registry: Arc::new(PinRegistry::default()),
        }
    }

    pub fn configure(&self, pin: u32, direction: Direction, pull: Pull) -> Result<GpioLine, AppError> {
        GpioLine::configure(self, pin, direction, pull)
    }

    pub fn driver(&self) -> &Arc<dyn GpioDriver> {
        &self.driver
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    pub fn claimed_pins(&self) -> Vec<u32> {
        self.registry.claimed()
    }
}

/// One claimed pin with a fixed direction and pull.
///
/// The claim is dropped with the line.
pub struct GpioLine {
    pin: u32,
    direction: Direction,
    pull: Pull,
    level: Mutex<Level>,
    driver: Arc<dyn GpioDriver>,
    registry: Arc<PinRegistry>,
    released: bool,
}

impl GpioLine {
    pub fn configure(gpio: &Gpio, pin: u32, direction: Direction, pull: Pull) -> Result<Self, AppError> {
        if direction == Direction::Output && pull != Pull::None {
            return Err(AppError::Configuration(format!(
                "pin {pin}: pull resistors only apply to inputs"
            )));
        }

        gpio.registry.claim(pin, PinOwner::Line)?;

        let initial = gpio
            .driver
            .configure_pin(pin, direction, pull)
            .and_then(|_| match direction {
                Direction::Input => gpio.driver.read_pin(pin),
                Direction::Output => Ok(Level::Low),
            });
        let level = match initial {
            Ok(level) => level,
            Err(e) => {
                gpio.registry.release(pin);
                return Err(e);
            }
        };

        Ok(Self {
            pin,
            direction,
            pull,
            level: Mutex::new(level),
            driver: gpio.driver.clone(),
            registry: gpio.registry.clone(),
            released: false,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pull(&self) -> Pull {
        self.pull
    }

    /// Last level read from or written to the line.
    pub fn level(&self) -> Level {
        *self.level.lock()
    }

    pub fn read(&self) -> Result<Level, AppError> {
        if self.direction == Direction::Output {
            return Err(AppError::InvalidOperation(format!(
                "pin {} is an output and cannot be read",
                self.pin
            )));
        }
        let level = self.driver.read_pin(self.pin)?;
        *self.level.lock() = level;
        Ok(level)
    }

    pub fn write(&self, level: Level) -> Result<(), AppError> {
        self.ensure_writable()?;
        let mut current = self.level.lock();
        self.driver.write_pin(self.pin, level)?;
        *current = level;
        Ok(())
    }

    /// Inverts the last written level and returns the new one.
    pub fn toggle(&self) -> Result<Level, AppError> {
        self.ensure_writable()?;
        let mut current = self.level.lock();
        let next = !*current;
        self.driver.write_pin(self.pin, next)?;
        *current = next;
        Ok(next)
    }

    fn ensure_writable(&self) -> Result<(), AppError> {
        if self.direction == Direction::Input {
            return Err(AppError::InvalidOperation(format!(
                "pin {} is an input and cannot be written",
                self.pin
            )));
        }
        Ok(())
    }

    pub fn release(mut self) -> Result<(), AppError> {
        self.release_inner()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn GpioDriver> {
        &self.driver
    }

    pub(crate) fn registry(&self) -> &Arc<PinRegistry> {
        &self.registry
    }

    fn release_inner(&mut self) -> Result<(), AppError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.driver.release_pin(self.pin);
        self.registry.release(self.pin);
        result
    }
}

impl Drop for GpioLine {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("failed to release pin {}: {e}", self.pin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, MockDriver};

    fn gpio() -> (Arc<MockDriver>, Gpio) {
        let driver = Arc::new(MockDriver::default());
        (driver.clone(), Gpio::new(driver))
    }

    #[test]
    fn second_configure_on_same_pin_fails() {
        let (_, gpio) = gpio();
        let _line = gpio.configure(16, Direction::Output, Pull::None).unwrap();
        let err = gpio
            .configure(16, Direction::Input, Pull::PullUp)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn release_allows_reconfigure() {
        let (driver, gpio) = gpio();
        let line = gpio.configure(16, Direction::Output, Pull::None).unwrap();
        line.release().unwrap();
        assert!(gpio.claimed_pins().is_empty());
        assert!(driver.calls().contains(&DriverCall::Release(16)));

        let again = gpio.configure(16, Direction::Input, Pull::PullDown).unwrap();
        drop(again);
        assert!(gpio.claimed_pins().is_empty());
    }

    #[test]
    fn write_on_input_and_read_on_output_are_rejected() {
        let (_, gpio) = gpio();
        let input = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let output = gpio.configure(16, Direction::Output, Pull::None).unwrap();

        assert!(input.write(Level::High).unwrap_err().is_invalid_operation());
        assert!(input.toggle().unwrap_err().is_invalid_operation());
        assert!(output.read().unwrap_err().is_invalid_operation());
    }

    #[test]
    fn pull_on_output_is_a_configuration_error() {
        let (_, gpio) = gpio();
        let err = gpio
            .configure(16, Direction::Output, Pull::PullUp)
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(gpio.claimed_pins().is_empty());
    }

    #[test]
    fn input_seeds_level_from_pull() {
        let (_, gpio) = gpio();
        let up = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let down = gpio.configure(4, Direction::Input, Pull::PullDown).unwrap();
        assert_eq!(up.level(), Level::High);
        assert_eq!(down.level(), Level::Low);
    }

    #[test]
    fn driver_failure_leaves_pin_unclaimed() {
        let (driver, gpio) = gpio();
        driver.fail_configure(7);
        assert!(matches!(
            gpio.configure(7, Direction::Output, Pull::None),
            Err(AppError::Driver(_))
        ));
        assert_eq!(gpio.registry().owner(7), None);
    }

    #[test]
    fn toggle_flips_level() {
        let (driver, gpio) = gpio();
        let led = gpio.configure(16, Direction::Output, Pull::None).unwrap();
        assert_eq!(led.toggle().unwrap(), Level::High);
        assert_eq!(led.toggle().unwrap(), Level::Low);
        assert_eq!(driver.writes(16), vec![Level::High, Level::Low]);
    }

    #[test]
    fn concurrent_toggles_alternate() {
        let (driver, gpio) = gpio();
        let led = Arc::new(gpio.configure(16, Direction::Output, Pull::None).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let led = led.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        led.toggle().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let writes = driver.writes(16);
        assert_eq!(writes.len(), 1000);
        assert_eq!(writes.first(), Some(&Level::High));
        assert!(writes.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(led.level(), Level::Low);
    }

    #[test]
    fn level_bits() {
        assert_eq!(Level::from_bit(1).unwrap(), Level::High);
        assert!(matches!(Level::from_bit(2), Err(AppError::InvalidValue(_))));
        assert_eq!(Level::Low.as_bit(), 0);
        assert_eq!(Edge::between(Level::Low, Level::High), Some(Edge::Rising));
        assert_eq!(Edge::between(Level::High, Level::High), None);
        assert!(Trigger::Both.matches(Edge::Falling));
        assert!(!Trigger::Rising.matches(Edge::Falling));
    }
}
