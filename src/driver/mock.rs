use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::AppError;
use crate::gpio::{
    Direction, Edge, EdgeCallback, EdgeEvent, EdgeNotification, GpioDriver, Level, Pull,
    SubscriptionHandle, Trigger, WatcherFault,
};

/// Driver calls recorded by [`MockDriver`], in issue order. Reads are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Configure {
        pin: u32,
        direction: Direction,
        pull: Pull,
    },
    Release(u32),
    Write(u32, Level),
    Subscribe {
        pin: u32,
        trigger: Trigger,
    },
    Unsubscribe(u32),
    SetPwmDutyCycle(u32, f64),
}

/// In-memory driver for tests and for running the server without hardware.
pub struct MockDriver {
    epoch: Instant,
    hardware_pwm: bool,
    next_subscription: AtomicU64,
    pins: Mutex<HashMap<u32, MockPinState>>,
    subscriptions: Mutex<HashMap<u64, MockSubscription>>,
    calls: Mutex<Vec<DriverCall>>,
    failing: Mutex<HashSet<u32>>,
    failing_pwm: Mutex<HashSet<u32>>,
}

struct MockPinState {
    direction: Direction,
    level: Level,
    duty_cycle: Option<f64>,
}

struct MockSubscription {
    pin: u32,
    trigger: Trigger,
    callback: EdgeCallback,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MockDriver {
    fn new(hardware_pwm: bool) -> Self {
        Self {
            epoch: Instant::now(),
            hardware_pwm,
            next_subscription: AtomicU64::new(1),
            pins: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            failing_pwm: Mutex::new(HashSet::new()),
        }
    }

    /// A driver that reports no PWM peripheral, forcing software waveforms.
    pub fn without_hardware_pwm() -> Self {
        Self::new(false)
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn writes(&self, pin: u32) -> Vec<Level> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Write(p, level) if *p == pin => Some(*level),
                _ => None,
            })
            .collect()
    }

    pub fn duty_cycles(&self, pin: u32) -> Vec<f64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::SetPwmDutyCycle(p, duty) if *p == pin => Some(*duty),
                _ => None,
            })
            .collect()
    }

    pub fn level(&self, pin: u32) -> Option<Level> {
        self.pins.lock().get(&pin).map(|p| p.level)
    }

    pub fn duty_cycle(&self, pin: u32) -> Option<f64> {
        self.pins.lock().get(&pin).and_then(|p| p.duty_cycle)
    }

    pub fn subscription_count(&self, pin: u32) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.pin == pin)
            .count()
    }

    /// Make every `configure_pin` call for `pin` fail.
    pub fn fail_configure(&self, pin: u32) {
        self.failing.lock().insert(pin);
    }

    /// Make every PWM request for `pin` fail.
    pub fn fail_pwm(&self, pin: u32) {
        self.failing_pwm.lock().insert(pin);
    }

    /// Drive an input from the outside world, as a button or sensor would.
    pub fn set_input_level(&self, pin: u32, level: Level) {
        let edge = {
            let mut pins = self.pins.lock();
            let Some(state) = pins.get_mut(&pin) else {
                return;
            };
            let old = state.level;
            state.level = level;
            Edge::between(old, level)
        };
        if let Some(edge) = edge {
            self.deliver(
                pin,
                EdgeNotification::Edge(EdgeEvent {
                    pin,
                    edge,
                    timestamp: self.epoch.elapsed(),
                }),
            );
        }
    }

    /// Deliver an edge with an explicit timestamp, regardless of the current level.
    pub fn inject_edge(&self, pin: u32, edge: Edge, at: Duration) {
        if let Some(state) = self.pins.lock().get_mut(&pin) {
            state.level = match edge {
                Edge::Rising => Level::High,
                Edge::Falling => Level::Low,
            };
        }
        self.deliver(
            pin,
            EdgeNotification::Edge(EdgeEvent {
                pin,
                edge,
                timestamp: at,
            }),
        );
    }

    pub fn inject_fault(&self, pin: u32, reason: &str) {
        self.deliver(
            pin,
            EdgeNotification::Fault(WatcherFault::SubscriptionLost {
                pin,
                reason: reason.to_string(),
            }),
        );
    }

    fn deliver(&self, pin: u32, notification: EdgeNotification) {
        // callbacks run without any mock lock held
        let callbacks: Vec<EdgeCallback> = self
            .subscriptions
            .lock()
            .values()
            .filter(|s| s.pin == pin)
            .filter(|s| match &notification {
                EdgeNotification::Edge(event) => s.trigger.matches(event.edge),
                EdgeNotification::Fault(_) => true,
            })
            .map(|s| s.callback.clone())
            .collect();

        for callback in callbacks {
            callback(notification.clone());
        }
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    fn not_configured(pin: u32) -> AppError {
        AppError::InvalidOperation(format!("pin {pin} not configured, configure it first"))
    }
}

impl GpioDriver for MockDriver {
    fn configure_pin(&self, pin: u32, direction: Direction, pull: Pull) -> Result<(), AppError> {
        if self.failing.lock().contains(&pin) {
            return Err(AppError::Driver(format!("cannot configure pin {pin}")));
        }
        self.record(DriverCall::Configure {
            pin,
            direction,
            pull,
        });

        let level = match (direction, pull) {
            (Direction::Input, Pull::PullUp) => Level::High,
            _ => Level::Low,
        };
        self.pins.lock().insert(
            pin,
            MockPinState {
                direction,
                level,
                duty_cycle: None,
            },
        );
        Ok(())
    }

    fn release_pin(&self, pin: u32) -> Result<(), AppError> {
        self.record(DriverCall::Release(pin));
        let dropped: Vec<EdgeCallback> = {
            let mut subscriptions = self.subscriptions.lock();
            let ids: Vec<u64> = subscriptions
                .iter()
                .filter(|(_, s)| s.pin == pin)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| subscriptions.remove(id))
                .map(|s| s.callback)
                .collect()
        };
        let removed = self.pins.lock().remove(&pin);

        let lost = EdgeNotification::Fault(WatcherFault::SubscriptionLost {
            pin,
            reason: "pin released".into(),
        });
        for callback in dropped {
            callback(lost.clone());
        }

        removed.map(|_| ()).ok_or_else(|| Self::not_configured(pin))
    }

    fn read_pin(&self, pin: u32) -> Result<Level, AppError> {
        self.pins
            .lock()
            .get(&pin)
            .map(|p| p.level)
            .ok_or_else(|| Self::not_configured(pin))
    }

    fn write_pin(&self, pin: u32, level: Level) -> Result<(), AppError> {
        let mut pins = self.pins.lock();
        let state = pins.get_mut(&pin).ok_or_else(|| Self::not_configured(pin))?;
        if state.direction != Direction::Output {
            return Err(AppError::InvalidOperation(
                "pin must be in output mode to set value".into(),
            ));
        }
        state.level = level;
        drop(pins);

        self.record(DriverCall::Write(pin, level));
        Ok(())
    }

    fn subscribe_edge(
        &self,
        pin: u32,
        trigger: Trigger,
        callback: EdgeCallback,
    ) -> Result<SubscriptionHandle, AppError> {
        match self.pins.lock().get(&pin) {
            Some(state) if state.direction == Direction::Input => {}
            Some(_) => {
                return Err(AppError::InvalidOperation(
                    "edge detection requires an input".into(),
                ));
            }
            None => return Err(Self::not_configured(pin)),
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().insert(
            id,
            MockSubscription {
                pin,
                trigger,
                callback,
            },
        );
        self.record(DriverCall::Subscribe { pin, trigger });
        Ok(SubscriptionHandle::new(id))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), AppError> {
        let removed = self.subscriptions.lock().remove(&handle.id());
        match removed {
            Some(sub) => {
                self.record(DriverCall::Unsubscribe(sub.pin));
                Ok(())
            }
            // released pins drop their subscriptions
            None => Ok(()),
        }
    }

    fn hardware_pwm(&self, pin: u32, _period: Duration) -> Result<bool, AppError> {
        if self.failing_pwm.lock().contains(&pin) {
            return Err(AppError::Driver(format!("PWM unavailable on pin {pin}")));
        }
        Ok(self.hardware_pwm)
    }

    fn set_pwm_duty_cycle(&self, pin: u32, percent: f64) -> Result<(), AppError> {
        if !self.hardware_pwm {
            return Err(AppError::Driver(format!(
                "hardware PWM not available on pin {pin}"
            )));
        }
        let mut pins = self.pins.lock();
        let state = pins.get_mut(&pin).ok_or_else(|| Self::not_configured(pin))?;
        state.duty_cycle = Some(percent);
        drop(pins);

        self.record(DriverCall::SetPwmDutyCycle(pin, percent));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn input_level_changes_notify_matching_subscribers() {
        let driver = MockDriver::default();
        driver
            .configure_pin(4, Direction::Input, Pull::PullDown)
            .unwrap();

        let rising = Arc::new(AtomicUsize::new(0));
        let counter = rising.clone();
        driver
            .subscribe_edge(
                4,
                Trigger::Rising,
                Arc::new(move |_: EdgeNotification| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        driver.set_input_level(4, Level::High);
        driver.set_input_level(4, Level::High);
        driver.set_input_level(4, Level::Low);
        driver.set_input_level(4, Level::High);

        assert_eq!(rising.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn writes_to_inputs_are_rejected() {
        let driver = MockDriver::default();
        driver
            .configure_pin(20, Direction::Input, Pull::PullUp)
            .unwrap();
        assert!(driver.write_pin(20, Level::Low).is_err());
        assert!(driver.writes(20).is_empty());
    }

    #[test]
    fn release_drops_subscriptions() {
        let driver = MockDriver::default();
        driver.configure_pin(4, Direction::Input, Pull::None).unwrap();
        driver
            .subscribe_edge(4, Trigger::Both, Arc::new(|_: EdgeNotification| {}))
            .unwrap();
        assert_eq!(driver.subscription_count(4), 1);
        driver.release_pin(4).unwrap();
        assert_eq!(driver.subscription_count(4), 0);
    }

    #[test]
    fn release_reports_lost_subscriptions_once() {
        let driver = MockDriver::default();
        driver.configure_pin(4, Direction::Input, Pull::None).unwrap();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        driver
            .subscribe_edge(
                4,
                Trigger::Both,
                Arc::new(move |n: EdgeNotification| sink.lock().push(n)),
            )
            .unwrap();

        driver.release_pin(4).unwrap();
        driver.configure_pin(4, Direction::Input, Pull::None).unwrap();
        driver.inject_edge(4, Edge::Rising, Duration::ZERO);

        assert_eq!(
            *faults.lock(),
            vec![EdgeNotification::Fault(WatcherFault::SubscriptionLost {
                pin: 4,
                reason: "pin released".into(),
            })]
        );
    }

    #[test]
    fn pwm_is_refused_without_hardware_support() {
        let driver = MockDriver::without_hardware_pwm();
        driver
            .configure_pin(19, Direction::Output, Pull::None)
            .unwrap();
        assert!(!driver.hardware_pwm(19, Duration::from_millis(20)).unwrap());
        assert!(driver.set_pwm_duty_cycle(19, 50.0).is_err());
    }
}
