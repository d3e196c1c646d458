//! Device classes and their property tables
//!
//! Every bridged device belongs to one [`DeviceClass`]. A class is described
//! entirely by data: the Venus service prefix, the upstream path prefix that
//! identifies its devices, and the list of bus properties it exports. The
//! export engine, normalizer and registry are all driven from this table.

pub mod naming;

use crate::dbus::PropertyType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device classes the bridge can emulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Battery,
    Tank,
    Switch,
    Environment,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [
        DeviceClass::Battery,
        DeviceClass::Tank,
        DeviceClass::Switch,
        DeviceClass::Environment,
    ];

    /// Lower-case identifier used in events and settings
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Battery => "battery",
            DeviceClass::Tank => "tank",
            DeviceClass::Switch => "switch",
            DeviceClass::Environment => "environment",
        }
    }

    /// Static descriptor for this class
    pub fn descriptor(self) -> &'static ClassDescriptor {
        match self {
            DeviceClass::Battery => &BATTERY,
            DeviceClass::Tank => &TANK,
            DeviceClass::Switch => &SWITCH,
            DeviceClass::Environment => &ENVIRONMENT,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = crate::error::BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "battery" | "batteries" => Ok(DeviceClass::Battery),
            "tank" | "tanks" => Ok(DeviceClass::Tank),
            "switch" | "switches" => Ok(DeviceClass::Switch),
            "environment" | "temperature" => Ok(DeviceClass::Environment),
            other => Err(crate::error::BridgeError::validation(
                "deviceType".to_string(),
                format!("unknown device type '{}'", other),
            )),
        }
    }
}

/// One bus-visible property of a device class
#[derive(Debug, Clone, Copy)]
pub struct PropertyDef {
    pub path: &'static str,
    pub kind: PropertyType,
    /// Static human-readable label returned by GetText
    pub text: &'static str,
    pub writable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Upstream suffix a remote write is reported back under
    pub source_suffix: Option<&'static str>,
}

const fn ro(path: &'static str, kind: PropertyType, text: &'static str) -> PropertyDef {
    PropertyDef {
        path,
        kind,
        text,
        writable: false,
        min: None,
        max: None,
        source_suffix: None,
    }
}

const fn ranged(
    path: &'static str,
    kind: PropertyType,
    text: &'static str,
    min: f64,
    max: f64,
) -> PropertyDef {
    PropertyDef {
        path,
        kind,
        text,
        writable: false,
        min: Some(min),
        max: Some(max),
        source_suffix: None,
    }
}

/// Data-only description of a device class
#[derive(Debug)]
pub struct ClassDescriptor {
    pub class: DeviceClass,
    /// Venus service prefix, e.g. `com.victronenergy.battery`
    pub service_prefix: &'static str,
    /// Upstream path segments that precede the device id
    pub container: &'static [&'static str],
    /// Name used when the path yields nothing more specific
    pub category_label: &'static str,
    pub product_name: &'static str,
    pub properties: &'static [PropertyDef],
}

impl ClassDescriptor {
    /// Look up a property definition by bus path
    pub fn property(&self, path: &str) -> Option<&'static PropertyDef> {
        self.properties.iter().find(|p| p.path == path)
    }

    /// Settings class name used in `ClassAndVrmInstance`
    pub fn settings_class(&self) -> &'static str {
        self.service_prefix
            .rsplit('.')
            .next()
            .unwrap_or(self.service_prefix)
    }
}

/// Identification paths present on every service
pub const IDENTITY_PROPERTIES: &[PropertyDef] = &[
    ro("/Mgmt/ProcessName", PropertyType::String, "Process name"),
    ro("/Mgmt/ProcessVersion", PropertyType::String, "Process version"),
    ro("/Mgmt/Connection", PropertyType::String, "Connection"),
    ro("/DeviceInstance", PropertyType::UInt32, "Device instance"),
    ro("/ProductId", PropertyType::UInt32, "Product id"),
    ro("/ProductName", PropertyType::String, "Product name"),
    PropertyDef {
        path: "/CustomName",
        kind: PropertyType::String,
        text: "Custom name",
        writable: true,
        min: None,
        max: None,
        source_suffix: None,
    },
    ro("/FirmwareVersion", PropertyType::String, "Firmware version"),
    ro("/Connected", PropertyType::Int32, "Connected"),
];

/// Generic product id for devices without a Victron product code
pub const GENERIC_PRODUCT_ID: u32 = 0xFFFF;

static BATTERY: ClassDescriptor = ClassDescriptor {
    class: DeviceClass::Battery,
    service_prefix: "com.victronenergy.battery",
    container: &["electrical", "batteries"],
    category_label: "Battery",
    product_name: "Battery Monitor",
    properties: &[
        ro("/Dc/0/Voltage", PropertyType::Double, "Voltage"),
        ro("/Dc/0/Current", PropertyType::Double, "Current"),
        ro("/Dc/0/Power", PropertyType::Double, "Power"),
        ro("/Dc/0/Temperature", PropertyType::Double, "Battery temperature"),
        ranged("/Soc", PropertyType::Double, "State of charge", 0.0, 100.0),
        ro("/TimeToGo", PropertyType::Int32, "Time to go"),
        ro("/ConsumedAmphours", PropertyType::Double, "Consumed amphours"),
        ro("/History/MinimumVoltage", PropertyType::Double, "Minimum voltage"),
        ro("/History/MaximumVoltage", PropertyType::Double, "Maximum voltage"),
        ro("/History/ChargedEnergy", PropertyType::Double, "Charged energy"),
        ro(
            "/History/DischargedEnergy",
            PropertyType::Double,
            "Discharged energy",
        ),
        ro("/History/TotalAhDrawn", PropertyType::Double, "Total Ah drawn"),
    ],
};

static TANK: ClassDescriptor = ClassDescriptor {
    class: DeviceClass::Tank,
    service_prefix: "com.victronenergy.tank",
    container: &["tanks"],
    category_label: "Tank",
    product_name: "Tank Sensor",
    properties: &[
        ranged("/Level", PropertyType::Double, "Level", 0.0, 100.0),
        ro("/Capacity", PropertyType::Double, "Capacity"),
        ro("/Remaining", PropertyType::Double, "Remaining"),
        ranged("/FluidType", PropertyType::Int32, "Fluid type", 0.0, 11.0),
    ],
};

static SWITCH: ClassDescriptor = ClassDescriptor {
    class: DeviceClass::Switch,
    service_prefix: "com.victronenergy.switch",
    container: &["electrical", "switches"],
    category_label: "Switch",
    product_name: "Switch",
    properties: &[
        PropertyDef {
            path: "/State",
            kind: PropertyType::Int32,
            text: "State",
            writable: true,
            min: Some(0.0),
            max: Some(1.0),
            source_suffix: Some("state"),
        },
        PropertyDef {
            path: "/DimmingLevel",
            kind: PropertyType::Int32,
            text: "Dimming level",
            writable: true,
            min: Some(0.0),
            max: Some(100.0),
            source_suffix: Some("dimmingLevel"),
        },
    ],
};

static ENVIRONMENT: ClassDescriptor = ClassDescriptor {
    class: DeviceClass::Environment,
    service_prefix: "com.victronenergy.temperature",
    container: &["environment"],
    category_label: "Environment",
    product_name: "Environment Sensor",
    properties: &[
        ro("/Temperature", PropertyType::Double, "Temperature"),
        ranged("/Humidity", PropertyType::Double, "Humidity", 0.0, 100.0),
        ro("/Pressure", PropertyType::Double, "Pressure"),
        ro("/TemperatureType", PropertyType::Int32, "Temperature type"),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_match_classes() {
        for class in DeviceClass::ALL {
            assert_eq!(class.descriptor().class, class);
        }
    }

    #[test]
    fn parse_device_type() {
        assert_eq!(
            "battery".parse::<DeviceClass>().unwrap(),
            DeviceClass::Battery
        );
        assert_eq!("Tanks".parse::<DeviceClass>().unwrap(), DeviceClass::Tank);
        assert!("inverter".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn switch_properties_are_writable_and_ranged() {
        let state = DeviceClass::Switch.descriptor().property("/State").unwrap();
        assert!(state.writable);
        assert_eq!(state.max, Some(1.0));
        let soc = DeviceClass::Battery.descriptor().property("/Soc").unwrap();
        assert!(!soc.writable);
    }

    #[test]
    fn settings_class_is_last_prefix_segment() {
        assert_eq!(DeviceClass::Battery.descriptor().settings_class(), "battery");
        assert_eq!(
            DeviceClass::Environment.descriptor().settings_class(),
            "temperature"
        );
    }
}
