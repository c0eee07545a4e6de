use std::{collections::HashSet, fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

/// What a configured pin may be used for.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinCapability {
    Input,
    Output,
    Pwm,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    pub capabilities: HashSet<PinCapability>,
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_event_history_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.broadcast_capacity == 0 {
            return Err(AppError::Config("broadcast_capacity must be non-zero".into()));
        }
        let mut seen = HashSet::new();
        for (id, pin) in &self.gpios {
            if !seen.insert((pin.chip.as_str(), pin.line)) {
                return Err(AppError::Config(format!(
                    "pin {id} maps to {}:{} which is already used",
                    pin.chip, pin.line
                )));
            }
            if pin.capabilities.contains(&PinCapability::Pwm)
                && !pin.capabilities.contains(&PinCapability::Output)
            {
                return Err(AppError::Config(format!(
                    "pin {id} is pwm-capable but not output-capable"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        "http": { "host": "localhost:8080", "path": "/api/v1", "timeout": 30 }
    "#;

    #[test]
    fn defaults_apply_for_capacities() {
        let json = format!(r#"{{ {BASE}, "gpios": {{}} }}"#);
        let config = AppConfig::from_json(&json).unwrap();
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.event_history_capacity, 64);
        assert!(config.gpios.is_empty());
    }

    #[test]
    fn duplicate_chip_line_is_rejected() {
        let json = format!(
            r#"{{ {BASE}, "gpios": {{
                "16": {{ "name": "a", "chip": "/dev/gpiochip0", "line": 16, "capabilities": ["output"] }},
                "17": {{ "name": "b", "chip": "/dev/gpiochip0", "line": 16, "capabilities": ["input"] }}
            }} }}"#
        );
        assert!(matches!(AppConfig::from_json(&json), Err(AppError::Config(_))));
    }

    #[test]
    fn pwm_requires_output() {
        let json = format!(
            r#"{{ {BASE}, "gpios": {{
                "19": {{ "name": "motor", "chip": "/dev/gpiochip0", "line": 19, "capabilities": ["pwm"] }}
            }} }}"#
        );
        assert!(matches!(AppConfig::from_json(&json), Err(AppError::Config(_))));
    }
}
