use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::gpio::{
    Direction, Edge, EdgeCallback, EdgeEvent, EdgeNotification, GpioDriver, Level, Pull,
    SubscriptionHandle, Trigger, WatcherFault,
};

const LIBGPIOD_DRIVER_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_DRIVER_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Character-device driver backed by libgpiod.
///
/// Pin ids are mapped to `(chip, line)` pairs from the configuration; each
/// configured pin owns its own line request.
pub struct LibgpiodDriver {
    lines: FxHashMap<u32, LineAddress>,
    pins: RwLock<FxHashMap<u32, PinHandle>>, // keyed by pin id
    subscriptions: Mutex<FxHashMap<u64, u32>>,
    next_subscription: AtomicU64,
}

struct LineAddress {
    chip: String,
    line: u32,
}

struct PinHandle {
    line: u32,
    direction: Direction,
    pull: Pull,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<(u64, EdgeListener)>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Driver(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| AppError::Driver(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Driver(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Driver(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    callback: EdgeCallback,
}

impl EdgeListener {
    fn new(
        pin: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        callback: EdgeCallback,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_DRIVER_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Driver(format!("event buffer: {e}")))?;

        let listener_callback = callback.clone();
        let handle = std::thread::spawn(move || {
            // the request lock is held only while polling, never while callbacks run
            let poll = || -> Result<Vec<EdgeEvent>, String> {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event = req
                    .wait_edge_events(Some(LIBGPIOD_DRIVER_EVENT_WAIT_TIMEOUT_MS))
                    .map_err(|e| {
                        warn!("wait edge events error for pin {pin}: {e}");
                        e.to_string()
                    })?;
                if !has_event {
                    return Ok(Vec::new());
                }

                let events = req.read_edge_events(&mut buffer).map_err(|e| {
                    warn!("read edge events error for pin {pin}: {e}");
                    e.to_string()
                })?;
                let mut pending = Vec::new();
                for evt in events {
                    let Ok(evt) = evt else { continue };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => Edge::Rising,
                        Ok(line::EdgeKind::Falling) => Edge::Falling,
                        Err(_) => continue,
                    };
                    pending.push(EdgeEvent {
                        pin,
                        edge,
                        timestamp: evt.timestamp(),
                    });
                }
                Ok(pending)
            };
            pump_edges(pin, &cancel_flag, &callback, poll);
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
            callback: listener_callback,
        })
    }
}

/// Feeds polled edges to `callback` until cancelled. A polling error ends the
/// loop and is reported once as a lost subscription.
fn pump_edges<F>(pin: u32, cancel: &AtomicBool, callback: &EdgeCallback, mut poll: F)
where
    F: FnMut() -> Result<Vec<EdgeEvent>, String>,
{
    while !cancel.load(Ordering::Relaxed) {
        let pending = match poll() {
            Ok(pending) => pending,
            Err(reason) => {
                if !cancel.load(Ordering::Relaxed) {
                    callback(EdgeNotification::Fault(WatcherFault::SubscriptionLost {
                        pin,
                        reason,
                    }));
                }
                return;
            }
        };
        for event in pending {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            callback(EdgeNotification::Edge(event));
        }
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // torn down from inside its own callback: the loop exits on the flag
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl LibgpiodDriver {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let lines = config
            .gpios
            .iter()
            .map(|(id, pin)| {
                (
                    *id,
                    LineAddress {
                        chip: pin.chip.clone(),
                        line: pin.line,
                    },
                )
            })
            .collect();

        Ok(Self {
            lines,
            pins: RwLock::new(FxHashMap::default()),
            subscriptions: Mutex::new(FxHashMap::default()),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn make_line_settings(
        direction: Direction,
        pull: Pull,
        trigger: Option<Trigger>,
    ) -> Result<line::Settings, AppError> {
        let mut ls = line::Settings::new()
            .map_err(|e| AppError::Driver(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Driver(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Driver(format!("set drive: {e}")))?;
                ls.set_output_value(line::Value::InActive)
                    .map_err(|e| AppError::Driver(format!("set output value: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Driver(format!("set direction: {e}")))?;
                let bias = match pull {
                    Pull::None => None,
                    Pull::PullUp => Some(line::Bias::PullUp),
                    Pull::PullDown => Some(line::Bias::PullDown),
                };
                ls.set_bias(bias)
                    .map_err(|e| AppError::Driver(format!("set bias: {e}")))?;
            }
        }

        if let Some(trigger) = trigger {
            let edge = match trigger {
                Trigger::Rising => line::Edge::Rising,
                Trigger::Falling => line::Edge::Falling,
                Trigger::Both => line::Edge::Both,
            };
            ls.set_edge_detection(Some(edge))
                .map_err(|e| AppError::Driver(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| AppError::Driver(format!("set event clock: {e}")))?;
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Driver(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Driver(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn reconfigure(handle: &PinHandle, trigger: Option<Trigger>) -> Result<(), AppError> {
        let line_settings = Self::make_line_settings(handle.direction, handle.pull, trigger)?;
        let line_cfg = Self::make_line_config(handle.line, line_settings)?;
        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| AppError::Driver(format!("reconfigure lines: {e}")))
    }

    fn not_configured(pin: u32) -> AppError {
        AppError::InvalidOperation(format!("pin {pin} not configured, configure it first"))
    }
}

impl GpioDriver for LibgpiodDriver {
    fn configure_pin(&self, pin: u32, direction: Direction, pull: Pull) -> Result<(), AppError> {
        let address = self.lines.get(&pin).ok_or(AppError::NotFoundPin(pin))?;

        let line_settings = Self::make_line_settings(direction, pull, None)?;
        let line_cfg = Self::make_line_config(address.line, line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&address.chip, &line_cfg)?));

        let previous = self.pins.write().insert(
            pin,
            PinHandle {
                line: address.line,
                direction,
                pull,
                gpiod_handle,
                listener: None,
            },
        );
        if previous.is_some() {
            warn!("pin {pin} was configured twice, previous request dropped");
        }
        debug!(
            "pin {pin} requested on {}:{} as {direction:?}",
            address.chip, address.line
        );
        Ok(())
    }

    fn release_pin(&self, pin: u32) -> Result<(), AppError> {
        let removed = self.pins.write().remove(&pin);
        let mut handle = removed.ok_or_else(|| Self::not_configured(pin))?;

        // stop the listener before the request goes away
        let lost = handle.listener.take().map(|(id, listener)| {
            self.subscriptions.lock().remove(&id);
            let callback = listener.callback.clone();
            drop(listener);
            callback
        });
        drop(handle);

        if let Some(callback) = lost {
            callback(EdgeNotification::Fault(WatcherFault::SubscriptionLost {
                pin,
                reason: "pin released".into(),
            }));
        }
        Ok(())
    }

    fn read_pin(&self, pin: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let handle = pins.get(&pin).ok_or_else(|| Self::not_configured(pin))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.line)
            .map_err(|e| AppError::Driver(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn write_pin(&self, pin: u32, level: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins.get(&pin).ok_or_else(|| Self::not_configured(pin))?;

        if handle.direction != Direction::Output {
            return Err(AppError::InvalidOperation(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                handle.line,
                match level {
                    Level::Low => line::Value::InActive,
                    Level::High => line::Value::Active,
                },
            )
            .map_err(|e| AppError::Driver(format!("set value: {e}")))?;
        Ok(())
    }

    fn subscribe_edge(
        &self,
        pin: u32,
        trigger: Trigger,
        callback: EdgeCallback,
    ) -> Result<SubscriptionHandle, AppError> {
        let mut pins = self.pins.write();
        let handle = pins.get_mut(&pin).ok_or_else(|| Self::not_configured(pin))?;

        if handle.direction != Direction::Input {
            return Err(AppError::InvalidOperation(
                "edge detection requires an input".into(),
            ));
        }
        if handle.listener.is_some() {
            return Err(AppError::InvalidOperation(format!(
                "pin {pin} already has an edge subscription"
            )));
        }

        Self::reconfigure(handle, Some(trigger))?;
        let listener = EdgeListener::new(pin, handle.gpiod_handle.clone(), callback)?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        handle.listener = Some((id, listener));
        self.subscriptions.lock().insert(id, pin);
        debug!("pin {pin} edge subscription {id} on {trigger:?}");
        Ok(SubscriptionHandle::new(id))
    }

    fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), AppError> {
        let Some(pin) = self.subscriptions.lock().remove(&subscription.id()) else {
            // already gone with its pin
            return Ok(());
        };

        let (listener, result) = {
            let mut pins = self.pins.write();
            let Some(handle) = pins.get_mut(&pin) else {
                return Ok(());
            };
            match handle.listener.take() {
                Some((id, listener)) if id == subscription.id() => {
                    (listener, Self::reconfigure(handle, None))
                }
                other => {
                    handle.listener = other;
                    return Ok(());
                }
            }
        };

        // callbacks may be waiting on the pin table, join outside of it
        drop(listener);
        debug!("pin {pin} edge subscription {} removed", subscription.id());
        result
    }
}
