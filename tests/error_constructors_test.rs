use venus_bridge::error::BridgeError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(BridgeError::config("x"), BridgeError::Config { .. }));
    assert!(matches!(BridgeError::dbus("x"), BridgeError::DBus { .. }));
    assert!(matches!(
        BridgeError::connection("x"),
        BridgeError::Connection { .. }
    ));
    assert!(matches!(
        BridgeError::not_connected("x"),
        BridgeError::NotConnected { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    let ser = BridgeError::Serialization {
        message: "s".into(),
    };
    assert!(matches!(ser, BridgeError::Serialization { .. }));
    assert!(matches!(BridgeError::io("x"), BridgeError::Io { .. }));
    assert!(matches!(
        BridgeError::registration("x"),
        BridgeError::Registration { .. }
    ));
    assert!(matches!(
        BridgeError::protocol("x"),
        BridgeError::Protocol { .. }
    ));
}

#[test]
fn error_constructors_group_3() {
    assert!(matches!(
        BridgeError::validation("f", "m"),
        BridgeError::Validation { .. }
    ));
    assert!(matches!(
        BridgeError::timeout("x"),
        BridgeError::Timeout { .. }
    ));
    assert!(matches!(
        BridgeError::generic("x"),
        BridgeError::Generic { .. }
    ));
}

#[test]
fn display_messages() {
    let e = BridgeError::validation("field", "bad");
    let s = format!("{}", e);
    assert!(s.contains("Validation error"));

    let e: BridgeError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
    assert!(format!("{}", e).contains("Serialization error"));
}
