use serde_json::json;
use venus_bridge::device::DeviceClass;
use venus_bridge::device::naming::{INDEX_MODULUS, device_index};
use venus_bridge::normalize::{classify_path, normalize};

#[test]
fn index_is_pure_and_bounded() {
    for path in [
        "electrical.batteries.house",
        "tanks.freshWater.0",
        "environment.inside.engineRoom",
        "electrical.switches.anchorLight",
        "",
    ] {
        let a = device_index(path);
        assert_eq!(a, device_index(path));
        assert!(a < INDEX_MODULUS);
    }
    // fixed value, so restarts and other platforms agree
    assert_eq!(device_index("abc"), 96354 % 1000);
}

#[test]
fn percentages_from_ratio_or_percent() {
    let soc = |v| {
        normalize(
            DeviceClass::Battery,
            "electrical.batteries.0.capacity.stateOfCharge",
            &json!(v),
        )
        .map(|n| n.value)
    };
    assert_eq!(soc(0.85).and_then(|v| v.as_f64()).map(|v| (v * 1e6).round()), Some(85e6));
    assert_eq!(soc(75.0), Some(json!(75.0)));

    let dim = |v| {
        normalize(
            DeviceClass::Switch,
            "electrical.switches.deck.dimmingLevel",
            &json!(v),
        )
        .map(|n| n.value)
    };
    assert_eq!(dim(0.75), Some(json!(75)));
    assert_eq!(dim(75.0), Some(json!(75)));
}

#[test]
fn invalid_input_is_ignored_not_raised() {
    let path = "environment.outside.humidity";
    assert!(normalize(DeviceClass::Environment, path, &json!(null)).is_none());
    assert!(normalize(DeviceClass::Environment, path, &json!("wet")).is_none());
    assert!(normalize(DeviceClass::Environment, path, &json!(150.0)).is_none());
    assert!(normalize(DeviceClass::Environment, path, &json!({"v": 1})).is_none());
}

#[test]
fn base_path_strips_property_suffix() {
    assert_eq!(
        classify_path(DeviceClass::Tank, "tanks.fuel.1.currentLevel"),
        Some(("tanks.fuel.1".to_string(), "/Level"))
    );
    assert_eq!(classify_path(DeviceClass::Tank, "tanks.fuel.1.name"), None);
}
