use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::AppError;
use crate::gpio::{
    Direction, EdgeCallback, EdgeEvent, EdgeNotification, GpioDriver, GpioLine,
    SubscriptionHandle, Trigger, WatcherFault,
};

/// Consumer of debounced edges from an [`EdgeWatcher`].
///
/// Any `FnMut(EdgeEvent)` closure is a handler. A handler must not block on
/// the watcher that drives it; `arm` and `disarm` called from inside the
/// handler are queued until it returns.
pub trait EdgeHandler: Send + 'static {
    fn on_edge(&mut self, event: EdgeEvent);

    /// Called once when the subscription fails. The watcher is idle afterwards.
    fn on_fault(&mut self, fault: WatcherFault) {
        warn!("{fault}");
    }
}

impl<F> EdgeHandler for F
where
    F: FnMut(EdgeEvent) + Send + 'static,
{
    fn on_edge(&mut self, event: EdgeEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherState {
    Idle,
    Armed,
    Firing,
}

struct ArmRequest {
    pin: u32,
    trigger: Trigger,
    debounce: Duration,
    driver: Arc<dyn GpioDriver>,
    handler: Box<dyn EdgeHandler>,
}

enum Queued {
    Arm(ArmRequest),
    Disarm,
    Fault { generation: u64, fault: WatcherFault },
}

struct Core {
    state: WatcherState,
    // bumped on every arm/disarm so late notifications from old subscriptions are ignored
    generation: u64,
    pin: Option<u32>,
    trigger: Trigger,
    debounce: Duration,
    last_delivered: Option<Duration>,
    driver: Option<Arc<dyn GpioDriver>>,
    subscription: Option<SubscriptionHandle>,
    handler: Option<Box<dyn EdgeHandler>>,
    firing_thread: Option<ThreadId>,
    queued: Vec<Queued>,
}

impl Core {
    fn firing_on_current_thread(&self) -> bool {
        self.firing_thread == Some(thread::current().id())
    }

    /// Moves to `Idle` and hands back what must be unsubscribed.
    fn reset(&mut self) -> Option<(Arc<dyn GpioDriver>, SubscriptionHandle)> {
        self.state = WatcherState::Idle;
        self.generation += 1;
        self.handler = None;
        self.last_delivered = None;
        let driver = self.driver.take();
        let subscription = self.subscription.take();
        driver.zip(subscription)
    }
}

struct Shared {
    core: Mutex<Core>,
    settled: Condvar,
}

/// Delivers debounced edges of one input line to a handler.
///
/// Handlers run on the driver's notification thread, never concurrently with
/// each other and never after [`EdgeWatcher::disarm`] has returned.
pub struct EdgeWatcher {
    shared: Arc<Shared>,
}

impl Default for EdgeWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeWatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: WatcherState::Idle,
                    generation: 0,
                    pin: None,
                    trigger: Trigger::Both,
                    debounce: Duration::ZERO,
                    last_delivered: None,
                    driver: None,
                    subscription: None,
                    handler: None,
                    firing_thread: None,
                    queued: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.shared.core.lock().state
    }

    /// Pin of the current or most recent subscription.
    pub fn pin(&self) -> Option<u32> {
        self.shared.core.lock().pin
    }

    pub fn trigger(&self) -> Trigger {
        self.shared.core.lock().trigger
    }

    pub fn debounce_window(&self) -> Duration {
        self.shared.core.lock().debounce
    }

    pub fn arm<H: EdgeHandler>(
        &self,
        line: &GpioLine,
        trigger: Trigger,
        debounce_window: Duration,
        handler: H,
    ) -> Result<(), AppError> {
        if line.direction() != Direction::Input {
            return Err(AppError::Configuration(format!(
                "pin {} is not an input, edges cannot be watched",
                line.pin()
            )));
        }

        let request = ArmRequest {
            pin: line.pin(),
            trigger,
            debounce: debounce_window,
            driver: line.driver().clone(),
            handler: Box::new(handler),
        };

        {
            let mut core = self.shared.core.lock();
            if core.firing_on_current_thread() {
                debug!("pin {}: arm queued until the handler returns", line.pin());
                core.queued.push(Queued::Arm(request));
                return Ok(());
            }
        }

        Shared::start(&self.shared, request)
    }

    /// Stops delivery. Waits for an in-flight handler running on another thread.
    pub fn disarm(&self) -> Result<(), AppError> {
        let release = {
            let mut core = self.shared.core.lock();
            if core.firing_on_current_thread() {
                core.queued.push(Queued::Disarm);
                return Ok(());
            }
            while core.state == WatcherState::Firing {
                self.shared.settled.wait(&mut core);
            }
            if core.state == WatcherState::Idle {
                return Ok(());
            }
            debug!("pin {:?}: watcher disarmed", core.pin);
            core.reset()
        };

        match release {
            Some((driver, subscription)) => driver.unsubscribe(subscription),
            None => Ok(()),
        }
    }
}

impl GpioLine {
    /// Creates a watcher already armed on this line.
    pub fn watch<H: EdgeHandler>(
        &self,
        trigger: Trigger,
        debounce_window: Duration,
        handler: H,
    ) -> Result<EdgeWatcher, AppError> {
        let watcher = EdgeWatcher::new();
        watcher.arm(self, trigger, debounce_window, handler)?;
        Ok(watcher)
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.disarm() {
            warn!("failed to disarm watcher: {e}");
        }
    }
}

impl Shared {
    fn start(shared: &Arc<Shared>, request: ArmRequest) -> Result<(), AppError> {
        let ArmRequest {
            pin,
            trigger,
            debounce,
            driver,
            handler,
        } = request;

        let generation = {
            let mut core = shared.core.lock();
            if core.state != WatcherState::Idle {
                return Err(AppError::InvalidOperation(format!(
                    "watcher is already armed on pin {}",
                    core.pin.unwrap_or(pin)
                )));
            }
            core.state = WatcherState::Armed;
            core.generation += 1;
            core.pin = Some(pin);
            core.trigger = trigger;
            core.debounce = debounce;
            core.last_delivered = None;
            core.driver = Some(driver.clone());
            core.handler = Some(handler);
            core.generation
        };

        let weak = Arc::downgrade(shared);
        let callback: EdgeCallback = Arc::new(move |notification: EdgeNotification| {
            Shared::dispatch(&weak, generation, notification)
        });
        let subscribed = driver.subscribe_edge(pin, trigger, callback);

        let mut core = shared.core.lock();
        match subscribed {
            Ok(subscription) if core.generation == generation => {
                core.subscription = Some(subscription);
                debug!("pin {pin}: watcher armed on {trigger:?}, debounce {debounce:?}");
                Ok(())
            }
            Ok(subscription) => {
                // disarmed or faulted while subscribing
                drop(core);
                driver.unsubscribe(subscription)
            }
            Err(e) => {
                if core.generation == generation {
                    core.reset();
                }
                Err(e)
            }
        }
    }

    fn dispatch(weak: &Weak<Shared>, generation: u64, notification: EdgeNotification) {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let mut core = shared.core.lock();
        while core.state == WatcherState::Firing && !core.firing_on_current_thread() {
            shared.settled.wait(&mut core);
        }
        if core.generation != generation {
            return;
        }
        if core.state == WatcherState::Firing {
            // the running handler dropped its own subscription, e.g. by releasing the line
            if let EdgeNotification::Fault(fault) = notification {
                core.queued.push(Queued::Fault { generation, fault });
            }
            return;
        }
        if core.state != WatcherState::Armed {
            return;
        }

        if let EdgeNotification::Edge(event) = &notification {
            if !core.trigger.matches(event.edge) {
                return;
            }
            if let Some(last) = core.last_delivered
                && event.timestamp.saturating_sub(last) < core.debounce
            {
                trace!("pin {}: {:?} edge inside debounce window", event.pin, event.edge);
                return;
            }
            core.last_delivered = Some(event.timestamp);
        }

        let Some(mut handler) = core.handler.take() else {
            return;
        };
        let pin = core.pin.unwrap_or_default();
        core.state = WatcherState::Firing;
        core.firing_thread = Some(thread::current().id());
        drop(core);

        let faulted = match notification {
            EdgeNotification::Edge(event) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_edge(event)));
                if outcome.is_err() {
                    error!("edge handler on pin {pin} panicked, watcher disarmed");
                    true
                } else {
                    false
                }
            }
            EdgeNotification::Fault(fault) => {
                warn!("pin {pin}: {fault}, watcher disarmed");
                let _ = catch_unwind(AssertUnwindSafe(|| handler.on_fault(fault)));
                true
            }
        };

        Shared::finish(&shared, handler, faulted);
    }

    fn finish(shared: &Arc<Shared>, handler: Box<dyn EdgeHandler>, faulted: bool) {
        let (release, queued) = {
            let mut core = shared.core.lock();
            core.firing_thread = None;
            let release = if faulted {
                core.reset()
            } else {
                core.state = WatcherState::Armed;
                core.handler = Some(handler);
                None
            };
            let queued = mem::take(&mut core.queued);
            shared.settled.notify_all();
            (release, queued)
        };

        if let Some((driver, subscription)) = release
            && let Err(e) = driver.unsubscribe(subscription)
        {
            warn!("failed to drop edge subscription: {e}");
        }

        for op in queued {
            match op {
                Queued::Disarm => {
                    let release = {
                        let mut core = shared.core.lock();
                        if core.state == WatcherState::Idle {
                            continue;
                        }
                        core.reset()
                    };
                    if let Some((driver, subscription)) = release
                        && let Err(e) = driver.unsubscribe(subscription)
                    {
                        warn!("failed to drop edge subscription: {e}");
                    }
                }
                Queued::Arm(request) => {
                    let pin = request.pin;
                    if let Err(e) = Shared::start(shared, request) {
                        warn!("queued arm on pin {pin} dropped: {e}");
                    }
                }
                Queued::Fault { generation, fault } => {
                    let (handler, release) = {
                        let mut core = shared.core.lock();
                        if core.generation != generation || core.state != WatcherState::Armed {
                            continue;
                        }
                        (core.handler.take(), core.reset())
                    };
                    warn!("{fault}, watcher disarmed");
                    if let Some((driver, subscription)) = release
                        && let Err(e) = driver.unsubscribe(subscription)
                    {
                        warn!("failed to drop edge subscription: {e}");
                    }
                    if let Some(mut handler) = handler {
                        let _ = catch_unwind(AssertUnwindSafe(|| handler.on_fault(fault)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::driver::MockDriver;
    use crate::gpio::{Edge, Gpio, Level, Pull};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn setup() -> (Arc<MockDriver>, Gpio) {
        let driver = Arc::new(MockDriver::default());
        (driver.clone(), Gpio::new(driver))
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(EdgeEvent) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: EdgeEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn arm_requires_input() {
        let (_, gpio) = setup();
        let led = gpio.configure(16, Direction::Output, Pull::None).unwrap();
        let watcher = EdgeWatcher::new();
        let err = watcher.arm(&led, Trigger::Both, ms(0), |_: EdgeEvent| {}).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn arming_twice_is_invalid() {
        let (_, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let watcher = EdgeWatcher::new();
        watcher.arm(&button, Trigger::Both, ms(0), |_: EdgeEvent| {}).unwrap();
        let err = watcher
            .arm(&button, Trigger::Rising, ms(0), |_: EdgeEvent| {})
            .unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(watcher.trigger(), Trigger::Both);
    }

    #[test]
    fn debounce_window_is_inclusive() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let (count, handler) = counter();
        let watcher = EdgeWatcher::new();
        watcher.arm(&button, Trigger::Both, ms(50), handler).unwrap();

        driver.inject_edge(20, Edge::Falling, ms(1000));
        driver.inject_edge(20, Edge::Rising, ms(1049));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        driver.inject_edge(20, Edge::Falling, ms(1050));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn trigger_filters_edges() {
        let (driver, gpio) = setup();
        let sensor = gpio.configure(4, Direction::Input, Pull::PullDown).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let watcher = EdgeWatcher::new();
        watcher
            .arm(&sensor, Trigger::Rising, ms(0), move |e: EdgeEvent| {
                sink.lock().push(e.edge)
            })
            .unwrap();

        driver.set_input_level(4, Level::High);
        driver.set_input_level(4, Level::Low);
        driver.set_input_level(4, Level::High);
        assert_eq!(*seen.lock(), vec![Edge::Rising, Edge::Rising]);
    }

    #[test]
    fn disarm_stops_delivery_and_unsubscribes() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let (count, handler) = counter();
        let watcher = EdgeWatcher::new();
        watcher.arm(&button, Trigger::Both, ms(0), handler).unwrap();
        driver.inject_edge(20, Edge::Falling, ms(0));
        watcher.disarm().unwrap();
        driver.inject_edge(20, Edge::Rising, ms(500));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert_eq!(driver.subscription_count(20), 0);
        watcher.disarm().unwrap();
    }

    struct Recorder {
        edges: Arc<AtomicUsize>,
        faults: Arc<AtomicUsize>,
    }

    impl EdgeHandler for Recorder {
        fn on_edge(&mut self, _event: EdgeEvent) {
            self.edges.fetch_add(1, Ordering::SeqCst);
        }

        fn on_fault(&mut self, _fault: WatcherFault) {
            self.faults.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fault_is_delivered_once_and_idles() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let edges = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(AtomicUsize::new(0));
        let watcher = EdgeWatcher::new();
        watcher
            .arm(
                &button,
                Trigger::Both,
                ms(0),
                Recorder {
                    edges: edges.clone(),
                    faults: faults.clone(),
                },
            )
            .unwrap();

        driver.inject_fault(20, "device unplugged");
        driver.inject_fault(20, "device unplugged");
        driver.inject_edge(20, Edge::Falling, ms(10));

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(edges.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert_eq!(driver.subscription_count(20), 0);

        // no automatic re-arm, but a manual one works
        let (count, handler) = counter();
        watcher.arm(&button, Trigger::Both, ms(0), handler).unwrap();
        driver.inject_edge(20, Edge::Rising, ms(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_from_handler_is_queued() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let watcher = Arc::new(EdgeWatcher::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner = Arc::downgrade(&watcher);
        let c = count.clone();
        watcher
            .arm(&button, Trigger::Both, ms(0), move |_: EdgeEvent| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(w) = inner.upgrade() {
                    w.disarm().unwrap();
                    assert_eq!(w.state(), WatcherState::Firing);
                }
            })
            .unwrap();

        driver.inject_edge(20, Edge::Falling, ms(0));
        driver.inject_edge(20, Edge::Rising, ms(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn panicking_handler_idles_watcher() {
        struct Explodes;
        impl EdgeHandler for Explodes {
            fn on_edge(&mut self, _event: EdgeEvent) {
                panic!("boom");
            }
        }

        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let watcher = EdgeWatcher::new();
        watcher.arm(&button, Trigger::Both, ms(0), Explodes).unwrap();
        driver.inject_edge(20, Edge::Falling, ms(0));
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.disarm().unwrap();
    }

    #[test]
    fn drop_disarms() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let (count, handler) = counter();
        {
            let watcher = EdgeWatcher::new();
            watcher.arm(&button, Trigger::Both, ms(0), handler).unwrap();
        }
        driver.inject_edge(20, Edge::Falling, ms(0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(driver.subscription_count(20), 0);
    }

    #[test]
    fn releasing_the_line_faults_the_watcher() {
        let (driver, gpio) = setup();
        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        let edges = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(AtomicUsize::new(0));
        let watcher = EdgeWatcher::new();
        watcher
            .arm(
                &button,
                Trigger::Both,
                ms(0),
                Recorder {
                    edges: edges.clone(),
                    faults: faults.clone(),
                },
            )
            .unwrap();

        button.release().unwrap();
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert_eq!(faults.load(Ordering::SeqCst), 1);

        let button = gpio.configure(20, Direction::Input, Pull::PullUp).unwrap();
        driver.inject_edge(20, Edge::Falling, ms(0));
        assert_eq!(edges.load(Ordering::SeqCst), 0);

        let (count, handler) = counter();
        watcher.arm(&button, Trigger::Both, ms(0), handler).unwrap();
        driver.inject_edge(20, Edge::Rising, ms(10));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_releasing_its_own_line_idles_after_return() {
        let (driver, gpio) = setup();
        let slot = Arc::new(Mutex::new(Some(
            gpio.configure(20, Direction::Input, Pull::PullUp).unwrap(),
        )));
        let edges = Arc::new(AtomicUsize::new(0));
        let watcher = EdgeWatcher::new();
        {
            let held = slot.lock();
            let (slot, edges) = (slot.clone(), edges.clone());
            watcher
                .arm(held.as_ref().unwrap(), Trigger::Falling, ms(0), move |_: EdgeEvent| {
                    edges.fetch_add(1, Ordering::SeqCst);
                    drop(slot.lock().take());
                })
                .unwrap();
        }

        driver.inject_edge(20, Edge::Falling, ms(0));
        assert_eq!(edges.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(gpio.claimed_pins().is_empty());
        assert_eq!(driver.subscription_count(20), 0);
    }
}
