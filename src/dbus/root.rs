use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedValue;

use super::shared::{ServiceShared, lock_shared};
use super::util::str_owned_value;

/// Service root: whole-service GetValue/GetText maps and GetItems
pub struct RootBus {
    pub(crate) shared: Arc<Mutex<ServiceShared>>,
}

impl RootBus {
    pub fn new(shared: Arc<Mutex<ServiceShared>>) -> Self {
        Self { shared }
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl RootBus {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree_map(&self.shared, "/", false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree_map(&self.shared, "/", true))
    }

    #[zbus(name = "GetItems")]
    async fn get_items(&self) -> HashMap<String, HashMap<String, OwnedValue>> {
        let shared = lock_shared(&self.shared);
        let mut out: HashMap<String, HashMap<String, OwnedValue>> = HashMap::new();
        for (path, prop) in shared.properties.iter() {
            let mut entry: HashMap<String, OwnedValue> = HashMap::new();
            entry.insert("Value".to_string(), prop.owned_value());
            entry.insert("Text".to_string(), str_owned_value(&prop.text));
            out.insert(path.clone(), entry);
        }
        out
    }

    #[zbus(signal)]
    pub async fn items_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, HashMap<&str, OwnedValue>>,
    ) -> zbus::Result<()>;
}

/// Intermediate path node such as `/Dc` or `/Dc/0`
pub struct TreeNode {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<ServiceShared>>,
}

impl TreeNode {
    pub fn new(path: String, shared: Arc<Mutex<ServiceShared>>) -> Self {
        Self { path, shared }
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl TreeNode {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree_map(&self.shared, &self.path, false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(collect_subtree_map(&self.shared, &self.path, true))
    }
}

/// Values (or labels) of every property below `prefix`, keyed by relative path
fn collect_subtree_map(
    shared: &Mutex<ServiceShared>,
    prefix: &str,
    as_text: bool,
) -> HashMap<String, OwnedValue> {
    let shared = lock_shared(shared);
    let mut px = prefix.to_string();
    if !px.ends_with('/') {
        px.push('/');
    }
    let mut result: HashMap<String, OwnedValue> = HashMap::new();
    for (path, prop) in shared.properties.iter() {
        if let Some(suffix) = path.strip_prefix(&px) {
            let ov = if as_text {
                str_owned_value(&prop.text)
            } else {
                prop.owned_value()
            };
            result.insert(suffix.to_string(), ov);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::items::ServiceProperty;
    use crate::dbus::util::owned_value_to_json;
    use crate::device::DeviceClass;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn battery_shared() -> Arc<Mutex<ServiceShared>> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(ServiceShared::new(
            DeviceClass::Battery,
            "electrical.batteries.house".to_string(),
            "House".to_string(),
            tx,
        )));
        {
            let mut s = lock_shared(&shared);
            let desc = DeviceClass::Battery.descriptor();
            for (path, value) in [("/Dc/0/Voltage", json!(12.6)), ("/Soc", json!(80.0))] {
                let def = desc.property(path).unwrap();
                s.properties
                    .insert(path.to_string(), ServiceProperty::from_def(def, value));
            }
        }
        shared
    }

    #[tokio::test]
    async fn get_items_lists_every_property() {
        let root = RootBus::new(battery_shared());
        let items = root.get_items().await;
        assert_eq!(items.len(), 2);
        let voltage = items.get("/Dc/0/Voltage").unwrap();
        assert_eq!(owned_value_to_json(voltage.get("Value").unwrap()), json!(12.6));
        assert_eq!(
            owned_value_to_json(voltage.get("Text").unwrap()),
            json!("Voltage")
        );
    }

    #[test]
    fn subtree_map_is_relative_to_node() {
        let shared = battery_shared();
        let map = collect_subtree_map(&shared, "/Dc", false);
        assert_eq!(map.len(), 1);
        assert_eq!(owned_value_to_json(map.get("0/Voltage").unwrap()), json!(12.6));

        let all = collect_subtree_map(&shared, "/", true);
        assert_eq!(owned_value_to_json(all.get("Soc").unwrap()), json!("State of charge"));
    }
}
