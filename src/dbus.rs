//! D-Bus integration for Venus OS compatibility
//!
//! Each bridged device is published as its own `com.victronenergy.<class>`
//! service implementing the `com.victronenergy.BusItem` contract. The bus
//! itself sits behind [`BusHandle`] / [`BusConnector`] so the export engine
//! runs unchanged against zbus or the in-process [`MemoryBus`].

mod bus;
mod connection;
mod items;
mod memory;
mod root;
mod service;
mod settings;
mod shared;
mod util;

pub use bus::{BusConnector, BusHandle, BusObject, ItemChange, SettingsEntry, ZbusConnector};
pub use connection::{ConnectionController, ConnectionState};
pub use items::{BusItem, PropertyType, ServiceProperty};
pub use memory::{MemoryBus, SettingsBehavior};
pub use root::{RootBus, TreeNode};
pub use service::{BusService, ItemSnapshot};
pub use settings::{InstanceGrant, SettingsRegistrar};
pub use shared::{
    SET_OK, SET_OUT_OF_RANGE, SET_READ_ONLY, SET_TYPE_MISMATCH, SET_UNKNOWN_PATH,
};

use crate::config::DbusConfig;
use std::sync::Arc;

/// Well-known name of the Venus settings service
pub const SETTINGS_SERVICE: &str = "com.victronenergy.settings";
/// Object path of the settings root
pub const SETTINGS_PATH: &str = "/Settings";
/// Interface exposing AddSettings
pub const SETTINGS_INTERFACE: &str = "com.victronenergy.Settings";

/// Build the connector selected by `dbus.address`
pub fn connector_for(config: &DbusConfig) -> Arc<dyn BusConnector> {
    match config.address.as_str() {
        "memory" => MemoryBus::new().connector(),
        other => Arc::new(ZbusConnector::new(other)),
    }
}
