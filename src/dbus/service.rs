use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::bus::{BusHandle, BusObject, ItemChange};
use super::items::{BusItem, ServiceProperty};
use super::root::{RootBus, TreeNode};
use super::shared::{ServiceShared, apply_set_value, lock_shared};
use crate::device::{DeviceClass, GENERIC_PRODUCT_ID, IDENTITY_PROPERTIES, PropertyDef};
use crate::error::{BridgeError, Result};
use crate::events::BridgeEvent;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::registry::DeviceInstance;

/// Value and label of one property, as returned by GetItems
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSnapshot {
    pub value: Value,
    pub text: String,
}

/// One virtual device on the bus
pub struct BusService {
    service_name: String,
    class: DeviceClass,
    base_path: String,
    pub(crate) shared: Arc<Mutex<ServiceShared>>,
    registered: tokio::sync::Mutex<HashSet<String>>,
    handle: Arc<dyn BusHandle>,
    logger: StructuredLogger,
}

impl BusService {
    /// Export the root object and the identification items on a handle that
    /// already owns `service_name`
    pub async fn start(
        service_name: String,
        class: DeviceClass,
        instance: &DeviceInstance,
        handle: Arc<dyn BusHandle>,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Result<Self> {
        let mut shared =
            ServiceShared::new(class, instance.base_path.clone(), instance.name.clone(), events_tx);
        shared.handle = Some(Arc::clone(&handle));
        let shared = Arc::new(Mutex::new(shared));
        let logger = get_logger_with_context(
            LogContext::new("dbus")
                .with_device_class(class.as_str())
                .with_base_path(&instance.base_path)
                .with_field("service", service_name.clone()),
        );

        handle
            .export("/", BusObject::Root(RootBus::new(Arc::clone(&shared))))
            .await?;

        let service = Self {
            service_name,
            class,
            base_path: instance.base_path.clone(),
            shared,
            registered: tokio::sync::Mutex::new(HashSet::from(["/".to_string()])),
            handle,
            logger,
        };

        let descriptor = class.descriptor();
        let identity = [
            ("/Mgmt/ProcessName", Value::from(env!("CARGO_PKG_NAME"))),
            ("/Mgmt/ProcessVersion", Value::from(env!("CARGO_PKG_VERSION"))),
            ("/Mgmt/Connection", Value::from(service.handle.describe())),
            ("/DeviceInstance", Value::from(instance.device_instance())),
            ("/ProductId", Value::from(GENERIC_PRODUCT_ID)),
            ("/ProductName", Value::from(descriptor.product_name)),
            ("/CustomName", Value::from(instance.name.clone())),
            ("/FirmwareVersion", Value::from(env!("CARGO_PKG_VERSION"))),
            ("/Connected", Value::from(1)),
        ];
        for (path, value) in identity {
            service.export(path, value).await?;
        }

        service
            .logger
            .info(&format!("D-Bus service started: {}", service.service_name));
        Ok(service)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn definition(&self, path: &str) -> Option<&'static PropertyDef> {
        self.class
            .descriptor()
            .property(path)
            .or_else(|| IDENTITY_PROPERTIES.iter().find(|p| p.path == path))
    }

    /// Write a property, registering it and its parent nodes on first use.
    ///
    /// Each path is exported at most once for the lifetime of the service;
    /// later calls only update the stored value and announce the change.
    pub async fn export(&self, path: &str, value: Value) -> Result<()> {
        let def = self.definition(path).ok_or_else(|| {
            BridgeError::validation(
                "path".to_string(),
                format!("{} is not a {} property", path, self.class),
            )
        })?;

        let mut registered = self.registered.lock().await;
        let newly_registered = !registered.contains(path);
        if newly_registered {
            self.register_path(&mut registered, def, &value).await?;
        }
        drop(registered);

        let change = {
            let mut shared = lock_shared(&self.shared);
            let Some(prop) = shared.properties.get_mut(path) else {
                return Err(BridgeError::protocol(format!(
                    "{} registered without a stored property",
                    path
                )));
            };
            if prop.value == value && !newly_registered {
                None
            } else {
                prop.value = value;
                Some(ItemChange::from_property(prop))
            }
        };

        if let Some(change) = change {
            self.handle.emit_changes(std::slice::from_ref(&change)).await?;
        }
        Ok(())
    }

    async fn register_path(
        &self,
        registered: &mut HashSet<String>,
        def: &'static PropertyDef,
        value: &Value,
    ) -> Result<()> {
        let segments: Vec<&str> = def.path.split('/').filter(|s| !s.is_empty()).collect();
        for i in 1..=segments.len() {
            let subpath = format!("/{}", segments[..i].join("/"));
            if registered.contains(&subpath) {
                continue;
            }
            if i == segments.len() {
                lock_shared(&self.shared).properties.insert(
                    subpath.clone(),
                    ServiceProperty::from_def(def, value.clone()),
                );
                let item = BusItem::new(subpath.clone(), Arc::clone(&self.shared));
                if let Err(e) = self.handle.export(&subpath, BusObject::Item(item)).await {
                    lock_shared(&self.shared).properties.remove(&subpath);
                    return Err(e);
                }
            } else {
                let node = TreeNode::new(subpath.clone(), Arc::clone(&self.shared));
                self.handle.export(&subpath, BusObject::Node(node)).await?;
            }
            self.logger.trace(&format!("Registered {}", subpath));
            registered.insert(subpath);
        }
        Ok(())
    }

    /// Local SetValue, with the same validation and notification as a remote one
    pub async fn set_value(&self, path: &str, value: Value) -> i32 {
        apply_set_value(&self.shared, path, value).await
    }

    pub fn get_value(&self, path: &str) -> Option<Value> {
        lock_shared(&self.shared)
            .properties
            .get(path)
            .map(|p| p.value.clone())
    }

    pub fn get_text(&self, path: &str) -> Option<String> {
        lock_shared(&self.shared)
            .properties
            .get(path)
            .map(|p| p.text.clone())
    }

    /// Every property with its value and label, identification included
    pub fn get_items(&self) -> BTreeMap<String, ItemSnapshot> {
        lock_shared(&self.shared)
            .properties
            .iter()
            .map(|(path, prop)| {
                (
                    path.clone(),
                    ItemSnapshot {
                        value: prop.value.clone(),
                        text: prop.text.clone(),
                    },
                )
            })
            .collect()
    }

    /// Mark the device disconnected and release its name
    pub async fn stop(&self) -> Result<()> {
        self.logger.info("Stopping D-Bus service");
        if let Err(e) = self.export("/Connected", Value::from(0)).await {
            self.logger
                .debug(&format!("Could not clear /Connected on stop: {}", e));
        }
        lock_shared(&self.shared).handle = None;
        self.handle.close().await
    }
}
