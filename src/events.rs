//! Notifications surfaced by the bridge to its caller

use crate::device::DeviceClass;
use serde::Serialize;
use serde_json::Value;

/// Output of the bridge, delivered on the event channel returned by
/// [`crate::bridge::Bridge::new`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// A remote party wrote a property through SetValue
    #[serde(rename_all = "camelCase")]
    ValueChanged {
        device_class: DeviceClass,
        base_path: String,
        /// Bus property path, e.g. `/State`
        property: String,
        /// Upstream path the write maps back to, when the property has one
        path: Option<String>,
        value: Value,
    },
    /// Informational status line for a device
    DataUpdated { category: String, text: String },
}
