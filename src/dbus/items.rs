use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedValue;

use super::shared::{ServiceShared, apply_set_value, lock_shared};
use super::util::{json_to_owned_value, owned_value_to_json, str_owned_value};
use crate::device::PropertyDef;

/// Wire type of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Int32,
    UInt32,
    Double,
    String,
    Boolean,
}

/// One bus-visible property held by a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceProperty {
    pub path: String,
    pub kind: PropertyType,
    /// `Null` means invalid
    pub value: serde_json::Value,
    pub text: String,
    pub writable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ServiceProperty {
    pub fn from_def(def: &PropertyDef, value: serde_json::Value) -> Self {
        Self {
            path: def.path.to_string(),
            kind: def.kind,
            value,
            text: def.text.to_string(),
            writable: def.writable,
            min: def.min,
            max: def.max,
        }
    }

    pub(crate) fn owned_value(&self) -> OwnedValue {
        json_to_owned_value(self.kind, &self.value)
    }
}

/// VeDbus-style BusItem implementing com.victronenergy.BusItem
pub struct BusItem {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<ServiceShared>>,
}

impl BusItem {
    pub fn new(path: String, shared: Arc<Mutex<ServiceShared>>) -> Self {
        Self { path, shared }
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let shared = lock_shared(&self.shared);
        match shared.properties.get(&self.path) {
            Some(prop) => prop.owned_value(),
            None => super::util::invalid_owned_value(),
        }
    }

    #[zbus(name = "SetValue")]
    async fn set_value(&self, value: OwnedValue) -> i32 {
        let incoming = owned_value_to_json(&value);
        apply_set_value(&self.shared, &self.path, incoming).await
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> String {
        let shared = lock_shared(&self.shared);
        shared
            .properties
            .get(&self.path)
            .map(|p| p.text.clone())
            .unwrap_or_default()
    }

    #[zbus(signal)]
    pub async fn properties_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, OwnedValue>,
    ) -> zbus::Result<()>;
}

impl BusItem {
    /// Value/Text pair in the shape carried by PropertiesChanged
    pub(crate) fn change_map(value: OwnedValue, text: &str) -> HashMap<&'static str, OwnedValue> {
        let mut changes = HashMap::new();
        changes.insert("Value", value);
        changes.insert("Text", str_owned_value(text));
        changes
    }
}
