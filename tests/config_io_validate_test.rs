use std::fs;
use venus_bridge::config::Config;
use venus_bridge::device::DeviceClass;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.dbus.address = "tcp:host=venus.local,port=78".to_string();
    cfg.classes.switch = false;
    cfg.battery.history_file = Some(
        path.with_extension("json")
            .to_string_lossy()
            .to_string(),
    );

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.dbus.address, "tcp:host=venus.local,port=78");
    assert!(!loaded.classes.is_enabled(DeviceClass::Switch));
    assert_eq!(loaded.battery.history_file, cfg.battery.history_file);
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();

    // Empty bus address
    cfg.dbus.address.clear();
    assert!(cfg.validate().is_err());

    // Zero settings timeout
    cfg = Config::default();
    cfg.dbus.settings_timeout_ms = 0;
    assert!(cfg.validate().is_err());

    // Inverted guard band
    cfg = Config::default();
    cfg.battery.min_voltage = 30.0;
    cfg.battery.max_voltage = 20.0;
    assert!(cfg.validate().is_err());

    // Negative guard band
    cfg = Config::default();
    cfg.battery.min_voltage = -1.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
