use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use zbus::Connection;
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::names::WellKnownName;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use super::items::{BusItem, PropertyType, ServiceProperty};
use super::root::{RootBus, TreeNode};
use super::util::{json_to_owned_value, str_owned_value};
use super::{SETTINGS_INTERFACE, SETTINGS_PATH, SETTINGS_SERVICE};
use crate::error::{BridgeError, Result};
use crate::logging::get_logger;

/// One `{key: variant}` dictionary of an AddSettings request or reply
pub type SettingsEntry = HashMap<String, OwnedValue>;

/// A value mutation to announce on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub path: String,
    pub kind: PropertyType,
    pub value: serde_json::Value,
    pub text: String,
}

impl ItemChange {
    pub fn from_property(prop: &ServiceProperty) -> Self {
        Self {
            path: prop.path.clone(),
            kind: prop.kind,
            value: prop.value.clone(),
            text: prop.text.clone(),
        }
    }
}

/// Object exported at a path of a service
pub enum BusObject {
    Root(RootBus),
    Node(TreeNode),
    Item(BusItem),
}

/// Abstract bus connection used by one service or one device class
#[async_trait]
pub trait BusHandle: Send + Sync {
    /// Human readable description of the transport, shown as /Mgmt/Connection
    fn describe(&self) -> String;

    /// Request a unique well-known name; an already-owned name is a protocol error
    async fn request_name(&self, name: &str) -> Result<()>;

    /// Export an object at a path
    async fn export(&self, path: &str, object: BusObject) -> Result<()>;

    /// Announce changed values (PropertiesChanged per item, ItemsChanged on the root)
    async fn emit_changes(&self, changes: &[ItemChange]) -> Result<()>;

    /// Invoke AddSettings on the settings service
    async fn add_settings(&self, entries: Vec<SettingsEntry>) -> Result<Vec<SettingsEntry>>;

    /// Release the name and drop the connection
    async fn close(&self) -> Result<()>;
}

/// Opens bus handles
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn BusHandle>>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector for a real D-Bus daemon (system, session or explicit address)
pub struct ZbusConnector {
    address: String,
}

impl ZbusConnector {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl BusConnector for ZbusConnector {
    async fn connect(&self) -> Result<std::sync::Arc<dyn BusHandle>> {
        let builder = match self.address.as_str() {
            "system" => zbus::connection::Builder::system(),
            "session" => zbus::connection::Builder::session(),
            addr => zbus::connection::Builder::address(addr),
        }
        .map_err(|e| {
            BridgeError::connection(format!("Invalid bus address '{}': {}", self.address, e))
        })?;

        let connection = tokio::time::timeout(CONNECT_TIMEOUT, builder.build())
            .await
            .map_err(|_| {
                BridgeError::timeout(format!("Connecting to D-Bus at {} timed out", self.address))
            })?
            .map_err(|e| {
                BridgeError::connection(format!("DBus connect to {} failed: {}", self.address, e))
            })?;

        Ok(std::sync::Arc::new(ZbusHandle {
            connection,
            address: self.address.clone(),
            name: std::sync::Mutex::new(None),
        }))
    }
}

/// zbus-backed handle
pub struct ZbusHandle {
    connection: Connection,
    address: String,
    name: std::sync::Mutex<Option<String>>,
}

impl ZbusHandle {
    fn owned_name(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BusHandle for ZbusHandle {
    fn describe(&self) -> String {
        format!("D-Bus ({})", self.address)
    }

    async fn request_name(&self, name: &str) -> Result<()> {
        let proxy = DBusProxy::new(&self.connection).await?;
        let well_known = WellKnownName::try_from(name)
            .map_err(|e| BridgeError::protocol(format!("Invalid service name '{}': {}", name, e)))?;
        let reply = proxy
            .request_name(well_known, RequestNameFlags::DoNotQueue.into())
            .await
            .map_err(|e| BridgeError::protocol(format!("RequestName {} failed: {}", name, e)))?;
        match reply {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
                *self
                    .name
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(name.to_string());
                Ok(())
            }
            RequestNameReply::Exists | RequestNameReply::InQueue => Err(BridgeError::protocol(
                format!("Service name {} is already owned", name),
            )),
        }
    }

    async fn export(&self, path: &str, object: BusObject) -> Result<()> {
        let server = self.connection.object_server();
        let added = match object {
            BusObject::Root(root) => server.at(path, root).await,
            BusObject::Node(node) => server.at(path, node).await,
            BusObject::Item(item) => server.at(path, item).await,
        }
        .map_err(|e| BridgeError::protocol(format!("Export at {} failed: {}", path, e)))?;
        if !added {
            return Err(BridgeError::protocol(format!(
                "An object is already exported at {}",
                path
            )));
        }
        Ok(())
    }

    async fn emit_changes(&self, changes: &[ItemChange]) -> Result<()> {
        let mut outer: HashMap<&str, HashMap<&str, OwnedValue>> = HashMap::new();
        for change in changes {
            let item_path = OwnedObjectPath::try_from(change.path.as_str()).map_err(|e| {
                BridgeError::dbus(format!("Invalid object path '{}': {}", change.path, e))
            })?;
            let item_ctx = SignalEmitter::new(&self.connection, item_path)?;
            let value = json_to_owned_value(change.kind, &change.value);
            if let Err(e) =
                BusItem::properties_changed(&item_ctx, BusItem::change_map(value, &change.text))
                    .await
            {
                get_logger("dbus").warn(&format!(
                    "PropertiesChanged for {} failed: {}",
                    change.path, e
                ));
            }

            let mut inner: HashMap<&str, OwnedValue> = HashMap::new();
            inner.insert("Value", json_to_owned_value(change.kind, &change.value));
            inner.insert("Text", str_owned_value(&change.text));
            outer.insert(change.path.as_str(), inner);
        }
        let root_ctx = SignalEmitter::new(&self.connection, "/")?;
        RootBus::items_changed(&root_ctx, outer).await?;
        Ok(())
    }

    async fn add_settings(&self, entries: Vec<SettingsEntry>) -> Result<Vec<SettingsEntry>> {
        let reply = self
            .connection
            .call_method(
                Some(SETTINGS_SERVICE),
                SETTINGS_PATH,
                Some(SETTINGS_INTERFACE),
                "AddSettings",
                &(entries,),
            )
            .await
            .map_err(|e| BridgeError::registration(format!("AddSettings call failed: {}", e)))?;
        let body = reply.body();
        let parsed: Vec<SettingsEntry> = body
            .deserialize()
            .map_err(|e| BridgeError::registration(format!("Unexpected AddSettings reply: {}", e)))?;
        Ok(parsed)
    }

    async fn close(&self) -> Result<()> {
        let logger = get_logger("dbus");
        if let Some(name) = self.owned_name() {
            if let Ok(proxy) = DBusProxy::new(&self.connection).await
                && let Ok(well_known) = WellKnownName::try_from(name.as_str())
            {
                let _ = proxy.release_name(well_known).await;
            }
            logger.info(&format!("Released D-Bus name {}", name));
        }
        self.connection.clone().close().await?;
        Ok(())
    }
}
