use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{AppConfig, PinCapability, PinConfig};
use crate::error::AppError;
use crate::gpio::{Direction, Edge, EdgeEvent, Gpio, GpioDriver, GpioLine, Level, Pull, Trigger};
use crate::pwm::PwmChannel;
use crate::watcher::{EdgeHandler, EdgeWatcher};

/// Edge as reported to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub pin_id: u32,
    pub edge: Edge,
    pub timestamp_ms: u64,
}

impl From<EdgeEvent> for EventRecord {
    fn from(event: EdgeEvent) -> Self {
        Self {
            pin_id: event.pin,
            edge: event.edge,
            timestamp_ms: event.timestamp.as_millis() as u64,
        }
    }
}

pub struct EventRecorder {
    event_tx: broadcast::Sender<EventRecord>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EventRecord>>>,
    event_history_capacity: usize,
}

impl EventRecorder {
    pub fn new(
        event_tx: broadcast::Sender<EventRecord>,
        event_history: FxHashMap<u32, RwLock<VecDeque<EventRecord>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EventRecord) {
        if let Some(history_lock) = self.event_history.get(&event.pin_id) {
            let mut history = history_lock.write();
            while !history.is_empty() && history.len() >= self.event_history_capacity {
                history.pop_front();
            }
            if self.event_history_capacity > 0 {
                history.push_back(event.clone());
            }
        }
        let _ = self.event_tx.send(event);
    }
}

struct RecordingHandler {
    recorder: Arc<EventRecorder>,
}

impl EdgeHandler for RecordingHandler {
    fn on_edge(&mut self, event: EdgeEvent) {
        self.recorder.dispatch(event.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSettings {
    pub trigger: Trigger,
    #[serde(default)]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PinMode {
    Released,
    Input {
        pull: Pull,
        level: Level,
        watch: Option<WatchSettings>,
    },
    Output {
        level: Level,
    },
    Pwm {
        period_ms: u64,
        duty_cycle: f64,
        hardware: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PinDescriptor {
    pub info: PinConfig,
    pub mode: PinMode,
}

enum PinSlot {
    // fields drop in order: the watcher goes before its line
    Line {
        watch: Option<(WatchSettings, EdgeWatcher)>,
        line: GpioLine,
    },
    Pwm(PwmChannel),
}

impl PinSlot {
    fn mode(&self) -> PinMode {
        match self {
            PinSlot::Line { line, watch } => match line.direction() {
                Direction::Input => PinMode::Input {
                    pull: line.pull(),
                    level: line.level(),
                    watch: watch.as_ref().map(|(settings, _)| *settings),
                },
                Direction::Output => PinMode::Output {
                    level: line.level(),
                },
            },
            PinSlot::Pwm(pwm) => PinMode::Pwm {
                period_ms: pwm.period().as_millis() as u64,
                duty_cycle: pwm.duty_cycle(),
                hardware: pwm.is_hardware(),
            },
        }
    }
}

/// Owns every line, watcher and PWM channel created through the API.
pub struct GpioManager {
    config: Arc<AppConfig>,
    gpio: Gpio,
    slots: Mutex<FxHashMap<u32, PinSlot>>,
    recorder: Arc<EventRecorder>,
}

impl GpioManager {
    pub fn new(config: Arc<AppConfig>, driver: Arc<dyn GpioDriver>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);

        let mut history = FxHashMap::default();
        for id in config.gpios.keys() {
            history.insert(*id, RwLock::new(VecDeque::new()));
        }

        let recorder = Arc::new(EventRecorder::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        Self {
            config,
            gpio: Gpio::new(driver),
            slots: Mutex::new(FxHashMap::default()),
            recorder,
        }
    }

    pub fn gpio(&self) -> &Gpio {
        &self.gpio
    }

    fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.config
            .gpios
            .get(&pin_id)
            .ok_or(AppError::NotFoundPin(pin_id))
    }

    fn require_capability(&self, pin_id: u32, capability: PinCapability) -> Result<(), AppError> {
        if self.pin_config(pin_id)?.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(AppError::InvalidOperation(format!(
                "pin {pin_id} does not support {capability:?}"
            )))
        }
    }

    fn not_configured(pin_id: u32) -> AppError {
        AppError::InvalidOperation(format!("pin {pin_id} is not configured"))
    }

    pub fn list_pins(&self) -> HashMap<u32, PinDescriptor> {
        let slots = self.slots.lock();
        self.config
            .gpios
            .iter()
            .map(|(id, cfg)| {
                let mode = slots.get(id).map_or(PinMode::Released, PinSlot::mode);
                (
                    *id,
                    PinDescriptor {
                        info: cfg.clone(),
                        mode,
                    },
                )
            })
            .collect()
    }

    pub fn pin_descriptor(&self, pin_id: u32) -> Result<PinDescriptor, AppError> {
        let info = self.pin_config(pin_id)?.clone();
        let mode = self.pin_mode(pin_id)?;
        Ok(PinDescriptor { info, mode })
    }

    pub fn pin_info(&self, pin_id: u32) -> Result<PinConfig, AppError> {
        self.pin_config(pin_id).cloned()
    }

    pub fn pin_mode(&self, pin_id: u32) -> Result<PinMode, AppError> {
        self.pin_config(pin_id)?;
        Ok(self
            .slots
            .lock()
            .get(&pin_id)
            .map_or(PinMode::Released, PinSlot::mode))
    }

    pub fn setup(&self, pin_id: u32, direction: Direction, pull: Pull) -> Result<PinMode, AppError> {
        let capability = match direction {
            Direction::Input => PinCapability::Input,
            Direction::Output => PinCapability::Output,
        };
        self.require_capability(pin_id, capability)?;

        let mut slots = self.slots.lock();
        let line = self.gpio.configure(pin_id, direction, pull)?;
        let slot = PinSlot::Line { line, watch: None };
        let mode = slot.mode();
        slots.insert(pin_id, slot);
        info!("pin {pin_id} set up as {direction:?} ({pull:?})");
        Ok(mode)
    }

    pub fn release(&self, pin_id: u32) -> Result<(), AppError> {
        self.pin_config(pin_id)?;
        let slot = self
            .slots
            .lock()
            .remove(&pin_id)
            .ok_or_else(|| Self::not_configured(pin_id))?;

        match slot {
            PinSlot::Line { line, watch } => {
                if let Some((_, watcher)) = watch {
                    watcher.disarm()?;
                }
                line.release()?;
            }
            PinSlot::Pwm(pwm) => pwm.stop()?,
        }
        info!("pin {pin_id} released");
        Ok(())
    }

    pub fn read_value(&self, pin_id: u32) -> Result<Level, AppError> {
        self.pin_config(pin_id)?;
        let slots = self.slots.lock();
        match slots.get(&pin_id) {
            Some(PinSlot::Line { line, .. }) => match line.direction() {
                Direction::Input => line.read(),
                // outputs report what they drive
                Direction::Output => Ok(line.level()),
            },
            Some(PinSlot::Pwm(_)) => Err(AppError::InvalidOperation(format!(
                "pin {pin_id} is driven by PWM"
            ))),
            None => Err(Self::not_configured(pin_id)),
        }
    }

    pub fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let level = Level::from_bit(value)?;
        self.pin_config(pin_id)?;
        let slots = self.slots.lock();
        match slots.get(&pin_id) {
            Some(PinSlot::Line { line, .. }) => line.write(level),
            Some(PinSlot::Pwm(_)) => Err(AppError::InvalidOperation(format!(
                "pin {pin_id} is driven by PWM"
            ))),
            None => Err(Self::not_configured(pin_id)),
        }
    }

    pub fn watch(&self, pin_id: u32, settings: WatchSettings) -> Result<(), AppError> {
        self.pin_config(pin_id)?;
        let mut slots = self.slots.lock();
        let Some(PinSlot::Line { line, watch }) = slots.get_mut(&pin_id) else {
            return Err(AppError::InvalidOperation(format!(
                "pin {pin_id} must be set up as an input to be watched"
            )));
        };
        if watch.is_some() {
            return Err(AppError::InvalidOperation(format!(
                "pin {pin_id} is already watched"
            )));
        }

        let watcher = line.watch(
            settings.trigger,
            Duration::from_millis(settings.debounce_ms),
            RecordingHandler {
                recorder: self.recorder.clone(),
            },
        )?;
        *watch = Some((settings, watcher));
        info!("pin {pin_id} watching {:?}", settings.trigger);
        Ok(())
    }

    pub fn unwatch(&self, pin_id: u32) -> Result<(), AppError> {
        self.pin_config(pin_id)?;
        let watcher = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&pin_id) {
                Some(PinSlot::Line { watch, .. }) => watch.take(),
                _ => None,
            }
        };
        match watcher {
            Some((_, watcher)) => watcher.disarm(),
            None => Err(AppError::InvalidOperation(format!(
                "pin {pin_id} is not watched"
            ))),
        }
    }

    /// Starts PWM, setting the pin up as an output first if it is released.
    pub fn start_pwm(&self, pin_id: u32, period_ms: u64, duty_cycle: f64) -> Result<PinMode, AppError> {
        self.require_capability(pin_id, PinCapability::Pwm)?;
        if period_ms == 0 {
            return Err(AppError::InvalidValue("period_ms must be non-zero".into()));
        }

        let mut slots = self.slots.lock();
        let (line, was_set_up) = match slots.remove(&pin_id) {
            None => (
                self.gpio.configure(pin_id, Direction::Output, Pull::None)?,
                false,
            ),
            Some(PinSlot::Line { watch: None, line }) if line.direction() == Direction::Output => {
                (line, true)
            }
            Some(other) => {
                slots.insert(pin_id, other);
                return Err(AppError::InvalidOperation(format!(
                    "pin {pin_id} must be a plain output to start PWM"
                )));
            }
        };

        let pwm = match PwmChannel::start(line, Duration::from_millis(period_ms), duty_cycle) {
            Ok(pwm) => pwm,
            Err(e) => {
                let (error, line) = e.into_parts();
                if was_set_up {
                    slots.insert(pin_id, PinSlot::Line { watch: None, line });
                }
                return Err(error);
            }
        };
        let slot = PinSlot::Pwm(pwm);
        let mode = slot.mode();
        slots.insert(pin_id, slot);
        info!("pin {pin_id} PWM started");
        Ok(mode)
    }

    pub fn set_duty_cycle(&self, pin_id: u32, duty_cycle: f64) -> Result<PinMode, AppError> {
        self.pin_config(pin_id)?;
        let slots = self.slots.lock();
        let Some(slot) = slots.get(&pin_id) else {
            return Err(Self::not_configured(pin_id));
        };
        let PinSlot::Pwm(pwm) = slot else {
            return Err(AppError::InvalidOperation(format!(
                "pin {pin_id} has no running PWM"
            )));
        };
        pwm.set_duty_cycle(duty_cycle)?;
        Ok(slot.mode())
    }

    pub fn stop_pwm(&self, pin_id: u32) -> Result<(), AppError> {
        self.pin_config(pin_id)?;
        let pwm = {
            let mut slots = self.slots.lock();
            match slots.remove(&pin_id) {
                Some(PinSlot::Pwm(pwm)) => pwm,
                Some(other) => {
                    slots.insert(pin_id, other);
                    return Err(AppError::InvalidOperation(format!(
                        "pin {pin_id} has no running PWM"
                    )));
                }
                None => return Err(Self::not_configured(pin_id)),
            }
        };
        pwm.stop()?;
        info!("pin {pin_id} PWM stopped");
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.recorder.event_tx.subscribe()
    }

    pub fn get_events(&self, pin_id: u32, limit: Option<usize>) -> Result<Vec<EventRecord>, AppError> {
        self.pin_config(pin_id)?;
        let map = &self.recorder.event_history;

        Ok(map
            .get(&pin_id)
            .map(|d| {
                let events: Vec<EventRecord> = if let Some(lim) = limit {
                    d.read().iter().rev().take(lim).cloned().collect()
                } else {
                    d.read().iter().cloned().collect()
                };
                if limit.is_some() {
                    events.into_iter().rev().collect()
                } else {
                    events
                }
            })
            .unwrap_or_default())
    }

    pub fn get_last_event(&self, pin_id: u32) -> Result<Option<EventRecord>, AppError> {
        self.pin_config(pin_id)?;
        let map = &self.recorder.event_history;

        Ok(map.get(&pin_id).and_then(|d| d.read().back().cloned()))
    }

    /// Stops every PWM channel and watcher and releases all pins.
    pub fn shutdown(&self) {
        let slots: Vec<(u32, PinSlot)> = self.slots.lock().drain().collect();
        for (pin_id, slot) in slots {
            let result = match slot {
                PinSlot::Line { line, watch } => {
                    drop(watch);
                    line.release()
                }
                PinSlot::Pwm(pwm) => pwm.stop(),
            };
            if let Err(e) = result {
                warn!("pin {pin_id}: shutdown failed: {e}");
            }
        }
    }
}
