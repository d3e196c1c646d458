//! Configuration management for the bridge
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::device::DeviceClass;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus connection and service naming
    pub dbus: DbusConfig,

    /// Which device classes are bridged
    pub classes: ClassesConfig,

    /// Battery accounting parameters
    pub battery: BatteryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Bus connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    /// `system`, `session`, `memory` or an explicit D-Bus address
    /// (e.g. `tcp:host=venus.local,port=78`)
    pub address: String,

    /// Suffix used in service names: `com.victronenergy.<class>.<suffix>_<index>`
    pub service_suffix: String,

    /// Timeout for the settings service AddSettings call
    pub settings_timeout_ms: u64,

    /// Minimum time between two connection attempts after a failure
    pub reconnect_cooldown_secs: u64,

    /// Return an error instead of silently dropping updates while disconnected
    pub propagate_not_connected: bool,
}

/// Enable flags per device class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassesConfig {
    pub battery: bool,
    pub tank: bool,
    pub switch: bool,
    pub environment: bool,
}

impl ClassesConfig {
    /// Whether updates for this class are bridged
    pub fn is_enabled(&self, class: DeviceClass) -> bool {
        match class {
            DeviceClass::Battery => self.battery,
            DeviceClass::Tank => self.tank,
            DeviceClass::Switch => self.switch,
            DeviceClass::Environment => self.environment,
        }
    }
}

/// Battery accounting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Lowest voltage accepted into the history extremes
    pub min_voltage: f64,

    /// Highest voltage accepted into the history extremes
    pub max_voltage: f64,

    /// Upstream path carrying the solar charger output current
    pub solar_current_path: Option<String>,

    /// Upstream path carrying the alternator output current
    pub alternator_current_path: Option<String>,

    /// JSON file used to keep history records across restarts
    pub history_file: Option<String>,

    /// Minimum interval between two history saves
    pub persist_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file or log directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "venus_bridge.yaml",
            "/data/venus_bridge.yaml",
            "/etc/venus-bridge/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dbus.address.trim().is_empty() {
            return Err(BridgeError::validation(
                "dbus.address",
                "Bus address cannot be empty",
            ));
        }

        if self.dbus.service_suffix.is_empty()
            || !self
                .dbus
                .service_suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BridgeError::validation(
                "dbus.service_suffix",
                "Must be non-empty and contain only [A-Za-z0-9_]",
            ));
        }

        if self.dbus.settings_timeout_ms == 0 {
            return Err(BridgeError::validation(
                "dbus.settings_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.battery.min_voltage < 0.0 {
            return Err(BridgeError::validation(
                "battery.min_voltage",
                "Must not be negative",
            ));
        }

        if self.battery.max_voltage <= self.battery.min_voltage {
            return Err(BridgeError::validation(
                "battery.max_voltage",
                "Must be greater than battery.min_voltage",
            ));
        }

        crate::logging::parse_log_level(&self.logging.level)?;

        Ok(())
    }
}
