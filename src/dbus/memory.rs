//! In-process bus
//!
//! Implements [`BusHandle`] without a D-Bus daemon. Used for the `memory`
//! dry-run address and throughout the test suite; it records every export,
//! change announcement and settings call so callers can assert on them.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use zbus::zvariant::OwnedValue;

use super::bus::{BusConnector, BusHandle, BusObject, ItemChange, SettingsEntry};
use super::service::ItemSnapshot;
use super::shared::{ServiceShared, apply_set_value, lock_shared};
use super::util::{owned_value_to_json, str_owned_value};
use crate::error::{BridgeError, Result};

/// How the simulated settings service answers AddSettings
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsBehavior {
    /// Accept every proposal as-is
    Echo,
    /// Answer every ClassAndVrmInstance request with this value
    Fixed(String),
    /// Fail the call
    Fail,
    /// Reply without a parsable class:instance value
    Malformed,
    /// Echo after sleeping
    Delay(Duration),
}

struct MemoryState {
    next_handle: u64,
    names: HashMap<String, u64>,
    objects: HashMap<u64, BTreeMap<String, BusObject>>,
    exports: Vec<(u64, String)>,
    changes: Vec<ItemChange>,
    settings_calls: usize,
    connects: usize,
    closes: usize,
    fail_next_connects: usize,
    settings: SettingsBehavior,
}

/// Shared in-process bus; clones refer to the same bus
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_handle: 1,
                names: HashMap::new(),
                objects: HashMap::new(),
                exports: Vec::new(),
                changes: Vec::new(),
                settings_calls: 0,
                connects: 0,
                closes: 0,
                fail_next_connects: 0,
                settings: SettingsBehavior::Echo,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> Arc<dyn BusConnector> {
        Arc::new(MemoryConnector { bus: self.clone() })
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_next_connects = n;
    }

    pub fn set_settings_behavior(&self, behavior: SettingsBehavior) {
        self.lock().settings = behavior;
    }

    /// Number of times `path` was exported under service `name`
    pub fn export_count(&self, name: &str, path: &str) -> usize {
        let state = self.lock();
        let Some(id) = state.names.get(name) else {
            return 0;
        };
        state
            .exports
            .iter()
            .filter(|(h, p)| h == id && p == path)
            .count()
    }

    /// Currently owned well-known names, sorted
    pub fn owned_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every change announced so far, in order
    pub fn changes(&self) -> Vec<ItemChange> {
        self.lock().changes.clone()
    }

    pub fn settings_calls(&self) -> usize {
        self.lock().settings_calls
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn shared_at(&self, service: &str, path: &str) -> Option<Arc<Mutex<ServiceShared>>> {
        let state = self.lock();
        let id = state.names.get(service)?;
        let object = state.objects.get(id)?.get(path)?;
        Some(match object {
            BusObject::Root(root) => Arc::clone(&root.shared),
            BusObject::Node(node) => Arc::clone(&node.shared),
            BusObject::Item(item) => Arc::clone(&item.shared),
        })
    }

    /// SetValue as a remote client would issue it. `None` if nothing is
    /// exported at that path.
    pub async fn remote_set_value(
        &self,
        service: &str,
        path: &str,
        value: serde_json::Value,
    ) -> Option<i32> {
        let shared = self.shared_at(service, path)?;
        Some(apply_set_value(&shared, path, value).await)
    }

    /// GetValue on an exported item
    pub fn remote_get_value(&self, service: &str, path: &str) -> Option<serde_json::Value> {
        let shared = self.shared_at(service, path)?;
        let state = lock_shared(&shared);
        state
            .properties
            .get(path)
            .map(|p| owned_value_to_json(&p.owned_value()))
    }

    /// GetText on an exported item
    pub fn remote_get_text(&self, service: &str, path: &str) -> Option<String> {
        let shared = self.shared_at(service, path)?;
        let state = lock_shared(&shared);
        state.properties.get(path).map(|p| p.text.clone())
    }

    /// GetItems on a service root
    pub fn remote_get_items(&self, service: &str) -> Option<BTreeMap<String, ItemSnapshot>> {
        let shared = self.shared_at(service, "/")?;
        let state = lock_shared(&shared);
        Some(
            state
                .properties
                .iter()
                .map(|(path, prop)| {
                    (
                        path.clone(),
                        ItemSnapshot {
                            value: owned_value_to_json(&prop.owned_value()),
                            text: prop.text.clone(),
                        },
                    )
                })
                .collect(),
        )
    }
}

struct MemoryConnector {
    bus: MemoryBus,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BusHandle>> {
        let mut state = self.bus.lock();
        state.connects += 1;
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(BridgeError::connection("memory bus refused the connection"));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(id, BTreeMap::new());
        Ok(Arc::new(MemoryHandle {
            bus: self.bus.clone(),
            id,
        }))
    }
}

struct MemoryHandle {
    bus: MemoryBus,
    id: u64,
}

fn settings_reply(
    behavior: &SettingsBehavior,
    entries: &[SettingsEntry],
) -> Result<Vec<SettingsEntry>> {
    if *behavior == SettingsBehavior::Fail {
        return Err(BridgeError::registration(
            "org.freedesktop.DBus.Error.ServiceUnknown: com.victronenergy.settings",
        ));
    }
    let mut reply = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry
            .get("path")
            .and_then(|v| <&str as TryFrom<&OwnedValue>>::try_from(v).ok())
            .unwrap_or_default()
            .to_string();
        let proposed = entry
            .get("default")
            .and_then(|v| <&str as TryFrom<&OwnedValue>>::try_from(v).ok())
            .unwrap_or_default()
            .to_string();
        let value = if path.ends_with("/ClassAndVrmInstance") {
            match behavior {
                SettingsBehavior::Fixed(v) => v.clone(),
                SettingsBehavior::Malformed => "garbage".to_string(),
                _ => proposed,
            }
        } else {
            proposed
        };
        let mut out: SettingsEntry = HashMap::new();
        out.insert("path".to_string(), str_owned_value(&path));
        out.insert("error".to_string(), OwnedValue::from(0i32));
        out.insert("value".to_string(), str_owned_value(&value));
        reply.push(out);
    }
    Ok(reply)
}

#[async_trait]
impl BusHandle for MemoryHandle {
    fn describe(&self) -> String {
        "In-process bus".to_string()
    }

    async fn request_name(&self, name: &str) -> Result<()> {
        let mut state = self.bus.lock();
        match state.names.get(name).copied() {
            Some(owner) if owner == self.id => Ok(()),
            Some(_) => Err(BridgeError::protocol(format!(
                "Service name {} is already owned",
                name
            ))),
            None => {
                state.names.insert(name.to_string(), self.id);
                Ok(())
            }
        }
    }

    async fn export(&self, path: &str, object: BusObject) -> Result<()> {
        let mut state = self.bus.lock();
        let id = self.id;
        let objects = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| BridgeError::connection("memory bus handle is closed"))?;
        if objects.contains_key(path) {
            return Err(BridgeError::protocol(format!(
                "An object is already exported at {}",
                path
            )));
        }
        objects.insert(path.to_string(), object);
        state.exports.push((id, path.to_string()));
        Ok(())
    }

    async fn emit_changes(&self, changes: &[ItemChange]) -> Result<()> {
        self.bus.lock().changes.extend_from_slice(changes);
        Ok(())
    }

    async fn add_settings(&self, entries: Vec<SettingsEntry>) -> Result<Vec<SettingsEntry>> {
        let behavior = {
            let mut state = self.bus.lock();
            state.settings_calls += 1;
            state.settings.clone()
        };
        if let SettingsBehavior::Delay(d) = behavior {
            tokio::time::sleep(d).await;
        }
        settings_reply(&behavior, &entries)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.bus.lock();
        let id = self.id;
        state.names.retain(|_, owner| *owner != id);
        state.objects.remove(&id);
        state.closes += 1;
        Ok(())
    }
}
