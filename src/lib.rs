mod config;
mod driver;
mod error;
mod gpio;
mod manager;
mod pwm;
mod routes;
mod watcher;

pub use config::{AppConfig, HttpConfig, PinCapability, PinConfig};
pub use error::AppError;
pub use gpio::{
    Direction, Edge, EdgeCallback, EdgeEvent, EdgeNotification, Gpio, GpioDriver, GpioLine, Level,
    PinOwner, PinRegistry, Pull, SubscriptionHandle, Trigger, WatcherFault,
};
pub use manager::{EventRecord, GpioManager, PinDescriptor, PinMode, WatchSettings};
pub use pwm::{PwmChannel, PwmStartError, PwmState, clamp_duty_cycle};
pub use routes::AppState;
pub use watcher::{EdgeHandler, EdgeWatcher, WatcherState};

#[cfg(feature = "hardware-gpio")]
pub use driver::LibgpiodDriver;
pub use driver::{DriverCall, MockDriver};
