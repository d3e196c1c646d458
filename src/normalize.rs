//! Value normalization
//!
//! Turns a raw upstream `(path, value)` pair into the canonical bus property
//! and physical unit for its device class. Malformed input (null, non-finite,
//! wrongly typed, or outside the property's declared range) yields `None`;
//! nothing in this module returns an error.
//!
//! Several rules disambiguate units from magnitude alone: a ratio in `[0,1]`
//! versus a percentage, Kelvin above 200 versus Celsius. A percentage of
//! exactly 1 or a Celsius reading above 200 is therefore misread. The
//! heuristics are kept for compatibility with existing telemetry sources.

use crate::device::{DeviceClass, PropertyDef};
use serde_json::{Value, json};

/// Readings above this are taken to be Kelvin
pub const KELVIN_THRESHOLD: f64 = 200.0;

const KELVIN_OFFSET: f64 = 273.15;

/// Result of normalizing one update
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Update path with the property suffix removed
    pub base_path: String,
    /// Bus property path, e.g. `/Dc/0/Voltage`
    pub property: &'static str,
    pub value: Value,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Plain,
    Integer,
    Percent,
    PercentInteger,
    Temperature,
    CubicMetersToLiters,
    PascalsToHectopascals,
    OnOff,
}

struct Mapping {
    suffix: &'static str,
    property: &'static str,
    rule: Rule,
}

const fn map(suffix: &'static str, property: &'static str, rule: Rule) -> Mapping {
    Mapping {
        suffix,
        property,
        rule,
    }
}

const BATTERY_MAP: &[Mapping] = &[
    map("capacity.stateOfCharge", "/Soc", Rule::Percent),
    map("capacity.timeRemaining", "/TimeToGo", Rule::Integer),
    map("capacity.consumedCharge", "/ConsumedAmphours", Rule::Plain),
    map("voltage", "/Dc/0/Voltage", Rule::Plain),
    map("current", "/Dc/0/Current", Rule::Plain),
    map("power", "/Dc/0/Power", Rule::Plain),
    map("temperature", "/Dc/0/Temperature", Rule::Temperature),
];

const TANK_MAP: &[Mapping] = &[
    map("currentLevel", "/Level", Rule::Percent),
    map("capacity", "/Capacity", Rule::CubicMetersToLiters),
    map("currentVolume", "/Remaining", Rule::CubicMetersToLiters),
];

const SWITCH_MAP: &[Mapping] = &[
    map("state", "/State", Rule::OnOff),
    map("dimmingLevel", "/DimmingLevel", Rule::PercentInteger),
];

const ENVIRONMENT_MAP: &[Mapping] = &[
    map("temperature", "/Temperature", Rule::Temperature),
    map("relativeHumidity", "/Humidity", Rule::Percent),
    map("humidity", "/Humidity", Rule::Percent),
    map("pressure", "/Pressure", Rule::PascalsToHectopascals),
];

fn mappings(class: DeviceClass) -> &'static [Mapping] {
    match class {
        DeviceClass::Battery => BATTERY_MAP,
        DeviceClass::Tank => TANK_MAP,
        DeviceClass::Switch => SWITCH_MAP,
        DeviceClass::Environment => ENVIRONMENT_MAP,
    }
}

/// Split an update path into `(base_path, property)` for a class.
///
/// Returns `None` when the path carries no property this class exports.
pub fn classify_path(class: DeviceClass, path: &str) -> Option<(String, &'static str)> {
    mappings(class).iter().find_map(|m| {
        strip_suffix(path, m.suffix).map(|base| (base.to_string(), m.property))
    })
}

fn strip_suffix<'a>(path: &'a str, suffix: &str) -> Option<&'a str> {
    let base = path.strip_suffix(suffix)?.strip_suffix('.')?;
    (!base.is_empty()).then_some(base)
}

/// Normalize one update for a device class
pub fn normalize(class: DeviceClass, path: &str, raw: &Value) -> Option<Normalized> {
    let (mapping, base) = mappings(class)
        .iter()
        .find_map(|m| strip_suffix(path, m.suffix).map(|base| (m, base)))?;

    let value = apply_rule(mapping.rule, raw)?;
    let def = class.descriptor().property(mapping.property)?;
    if !within_range(def, &value) {
        return None;
    }

    Some(Normalized {
        base_path: base.to_string(),
        property: mapping.property,
        value,
    })
}

fn apply_rule(rule: Rule, raw: &Value) -> Option<Value> {
    match rule {
        Rule::Plain => finite_number(raw).map(|v| json!(v)),
        Rule::Integer => finite_number(raw).map(|v| json!(v.round() as i64)),
        Rule::Percent => finite_number(raw).and_then(ratio_to_percent).map(|v| json!(v)),
        Rule::PercentInteger => finite_number(raw)
            .and_then(ratio_to_percent)
            .map(|v| json!(v.round() as i64)),
        Rule::Temperature => finite_number(raw).map(|v| json!(to_celsius(v))),
        Rule::CubicMetersToLiters => finite_number(raw)
            .filter(|v| *v >= 0.0)
            .map(|v| json!(v * 1000.0)),
        // Venus temperature services publish /Pressure in hPa, not bar
        Rule::PascalsToHectopascals => finite_number(raw).map(|v| json!(v / 100.0)),
        Rule::OnOff => on_off(raw).map(|v| json!(v)),
    }
}

fn within_range(def: &PropertyDef, value: &Value) -> bool {
    let Some(v) = value.as_f64() else {
        return true;
    };
    def.min.is_none_or(|min| v >= min) && def.max.is_none_or(|max| v <= max)
}

/// Extract a finite number; anything else is ignored
pub fn finite_number(raw: &Value) -> Option<f64> {
    raw.as_f64().filter(|v| v.is_finite())
}

/// `[0,1]` is a ratio and scaled to percent, `>1` is already a percentage
pub fn ratio_to_percent(v: f64) -> Option<f64> {
    if !v.is_finite() || v < 0.0 {
        None
    } else if v <= 1.0 {
        Some(v * 100.0)
    } else {
        Some(v)
    }
}

/// Readings above [`KELVIN_THRESHOLD`] are Kelvin, the rest already Celsius
pub fn to_celsius(v: f64) -> f64 {
    if v > KELVIN_THRESHOLD {
        v - KELVIN_OFFSET
    } else {
        v
    }
}

fn on_off(raw: &Value) -> Option<i32> {
    match raw {
        Value::Bool(b) => Some(i32::from(*b)),
        Value::Number(_) => finite_number(raw).map(|v| i32::from(v != 0.0)),
        _ => None,
    }
}

/// Venus fluid type for a tank base path, from its fluid segment
pub fn fluid_type(base_path: &str) -> Option<i32> {
    let fluid = base_path
        .split('.')
        .skip_while(|s| *s != "tanks")
        .nth(1)?;
    let code = match fluid {
        "fuel" => 0,
        "freshWater" => 1,
        "wasteWater" => 2,
        "liveWell" => 3,
        "lubrication" | "oil" => 4,
        "blackWater" => 5,
        "gasoline" => 6,
        "diesel" => 7,
        "lpg" => 8,
        "lng" => 9,
        "hydraulic" => 10,
        "rawWater" => 11,
        _ => return None,
    };
    Some(code)
}

/// Venus temperature type for an environment base path: 1 fridge,
/// 3 room, 4 outdoor, 6 freezer, otherwise 2 (generic)
pub fn temperature_type(base_path: &str) -> i32 {
    let lower = base_path.to_ascii_lowercase();
    if lower.contains("freezer") {
        6
    } else if lower.contains("fridge") || lower.contains("refrigerator") {
        1
    } else if lower.contains("outside") || lower.contains("outdoor") {
        4
    } else if lower.contains("inside") || lower.contains("cabin") || lower.contains("saloon") {
        3
    } else {
        2
    }
}

/// Inverse of the switch rules, used to report remote writes upstream
pub fn to_upstream(class: DeviceClass, property: &str, value: &Value) -> Value {
    match (class, property) {
        (DeviceClass::Switch, "/State") => json!(value.as_f64().is_some_and(|v| v != 0.0)),
        (DeviceClass::Switch, "/DimmingLevel") => match value.as_f64() {
            Some(v) => json!(v / 100.0),
            None => Value::Null,
        },
        _ => value.clone(),
    }
}
