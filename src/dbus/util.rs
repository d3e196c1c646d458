use super::items::PropertyType;
use zbus::zvariant::{OwnedValue, Value};

/// Venus encodes an invalid value as an empty integer array
pub(crate) fn invalid_owned_value() -> OwnedValue {
    OwnedValue::try_from(Value::from(Vec::<i32>::new())).unwrap_or_else(|_| OwnedValue::from(0i32))
}

pub(crate) fn str_owned_value(s: &str) -> OwnedValue {
    OwnedValue::try_from(Value::from(s)).unwrap_or_else(|_| invalid_owned_value())
}

/// Encode a stored value with the wire type of its property
pub(crate) fn json_to_owned_value(kind: PropertyType, v: &serde_json::Value) -> OwnedValue {
    if v.is_null() {
        return invalid_owned_value();
    }
    match kind {
        PropertyType::Int32 => v
            .as_f64()
            .map(|f| OwnedValue::from(f.round() as i32))
            .unwrap_or_else(invalid_owned_value),
        PropertyType::UInt32 => v
            .as_f64()
            .filter(|f| *f >= 0.0)
            .map(|f| OwnedValue::from(f.round() as u32))
            .unwrap_or_else(invalid_owned_value),
        PropertyType::Double => v
            .as_f64()
            .map(OwnedValue::from)
            .unwrap_or_else(invalid_owned_value),
        PropertyType::String => match v {
            serde_json::Value::String(s) => str_owned_value(s),
            other => str_owned_value(&other.to_string()),
        },
        PropertyType::Boolean => match v {
            serde_json::Value::Bool(b) => OwnedValue::from(*b),
            other => OwnedValue::from(other.as_f64().is_some_and(|f| f != 0.0)),
        },
    }
}

/// Decode an incoming variant of any basic type
pub(crate) fn owned_value_to_json(v: &OwnedValue) -> serde_json::Value {
    if let Ok(b) = <bool as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(b);
    }
    if let Ok(i) = <i32 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(i);
    }
    if let Ok(u) = <u32 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(i) = <i64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(i);
    }
    if let Ok(u) = <u64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(i) = <i16 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(i);
    }
    if let Ok(u) = <u16 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(u) = <u8 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(f) = <f64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(f);
    }
    if let Ok(s) = <&str as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(s.to_string());
    }
    serde_json::Value::Null
}

/// Coerce a written value to the property's type; `None` on mismatch
pub(crate) fn coerce(kind: PropertyType, v: &serde_json::Value) -> Option<serde_json::Value> {
    match kind {
        PropertyType::Int32 => match v {
            serde_json::Value::Bool(b) => Some(serde_json::json!(i32::from(*b))),
            _ => v
                .as_f64()
                .filter(|f| f.is_finite())
                .map(f64::round)
                .filter(|f| *f >= f64::from(i32::MIN) && *f <= f64::from(i32::MAX))
                .map(|f| serde_json::json!(f as i32)),
        },
        PropertyType::UInt32 => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(f64::round)
            .filter(|f| *f >= 0.0 && *f <= f64::from(u32::MAX))
            .map(|f| serde_json::json!(f as u32)),
        PropertyType::Double => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| serde_json::json!(f)),
        PropertyType::String => v.as_str().map(|s| serde_json::json!(s)),
        PropertyType::Boolean => match v {
            serde_json::Value::Bool(b) => Some(serde_json::json!(*b)),
            _ => v.as_f64().map(|f| serde_json::json!(f != 0.0)),
        },
    }
}
