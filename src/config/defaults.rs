use super::*;

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            address: "system".to_string(),
            service_suffix: "bridge".to_string(),
            settings_timeout_ms: 5000,
            reconnect_cooldown_secs: 30,
            propagate_not_connected: false,
        }
    }
}

impl Default for ClassesConfig {
    fn default() -> Self {
        Self {
            battery: true,
            tank: true,
            switch: true,
            environment: true,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            min_voltage: 5.0,
            max_voltage: 60.0,
            solar_current_path: Some("electrical.solar.current".to_string()),
            alternator_current_path: Some("electrical.alternators.current".to_string()),
            history_file: None,
            persist_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/venus_bridge.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbus: DbusConfig::default(),
            classes: ClassesConfig::default(),
            battery: BatteryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
