//! Instance-number registration with the Venus settings service
//!
//! A device proposes `<class>:<index>` under
//! `/Settings/Devices/<suffix>_<index>/ClassAndVrmInstance`. The settings
//! service either accepts the proposal or answers with the instance it
//! already holds for that device, which is what keeps VRM instance numbers
//! stable across restarts.

use std::collections::HashMap;
use std::time::Duration;
use zbus::zvariant::OwnedValue;

use super::bus::{BusHandle, SettingsEntry};
use super::util::{owned_value_to_json, str_owned_value};
use crate::config::DbusConfig;
use crate::device::DeviceClass;
use crate::error::{BridgeError, Result};
use crate::logging::{StructuredLogger, get_logger};

pub struct SettingsRegistrar {
    timeout: Duration,
    suffix: String,
    logger: StructuredLogger,
}

impl SettingsRegistrar {
    pub fn new(timeout: Duration, suffix: &str) -> Self {
        Self {
            timeout,
            suffix: suffix.to_string(),
            logger: get_logger("settings"),
        }
    }

    pub fn from_config(config: &DbusConfig) -> Self {
        Self::new(
            Duration::from_millis(config.settings_timeout_ms),
            &config.service_suffix,
        )
    }

    fn settings_root(&self, index: u32) -> String {
        format!("/Settings/Devices/{}_{}", self.suffix, index)
    }

    fn entries(&self, class: DeviceClass, index: u32, display_name: &str) -> Vec<SettingsEntry> {
        let root = self.settings_root(index);
        let class_name = class.descriptor().settings_class();
        vec![
            entry(
                &format!("{}/ClassAndVrmInstance", root),
                &format!("{}:{}", class_name, index),
                "Class and VRM instance",
            ),
            entry(&format!("{}/CustomName", root), display_name, "Custom name"),
        ]
    }

    /// Ask the settings service for an instance id
    pub async fn try_register(
        &self,
        handle: &dyn BusHandle,
        class: DeviceClass,
        proposed_index: u32,
        display_name: &str,
    ) -> Result<u32> {
        let entries = self.entries(class, proposed_index, display_name);
        let reply = tokio::time::timeout(self.timeout, handle.add_settings(entries))
            .await
            .map_err(|_| {
                BridgeError::timeout(format!(
                    "AddSettings did not answer within {} ms",
                    self.timeout.as_millis()
                ))
            })??;

        let wanted = format!("{}/ClassAndVrmInstance", self.settings_root(proposed_index));
        let item = reply
            .iter()
            .find(|e| {
                e.get("path")
                    .map(owned_value_to_json)
                    .is_some_and(|p| p.as_str() == Some(wanted.as_str()))
            })
            .or_else(|| reply.first())
            .ok_or_else(|| BridgeError::registration("AddSettings returned an empty reply"))?;

        if let Some(code) = item.get("error").map(owned_value_to_json)
            && code.as_i64() != Some(0)
        {
            return Err(BridgeError::registration(format!(
                "AddSettings rejected {} with error {}",
                wanted, code
            )));
        }

        let value = item
            .get("value")
            .map(owned_value_to_json)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| BridgeError::registration("AddSettings reply has no value"))?;

        parse_class_instance(&value).ok_or_else(|| {
            BridgeError::registration(format!("Malformed class:instance value '{}'", value))
        })
    }

    /// Like [`Self::try_register`] but never fails: on any error the
    /// proposed index is granted and the error is handed back for the
    /// caller to act on
    pub async fn register_instance(
        &self,
        handle: &dyn BusHandle,
        class: DeviceClass,
        proposed_index: u32,
        display_name: &str,
    ) -> InstanceGrant {
        match self
            .try_register(handle, class, proposed_index, display_name)
            .await
        {
            Ok(id) => {
                self.logger.info(&format!(
                    "Settings assigned {} instance {} (proposed {})",
                    class, id, proposed_index
                ));
                InstanceGrant {
                    instance_id: id,
                    failure: None,
                }
            }
            Err(e) => {
                self.logger.warn(&format!(
                    "Instance registration for {} failed, using {}: {}",
                    display_name, proposed_index, e
                ));
                InstanceGrant {
                    instance_id: proposed_index,
                    failure: Some(e),
                }
            }
        }
    }
}

/// Result of [`SettingsRegistrar::register_instance`]
#[derive(Debug)]
pub struct InstanceGrant {
    /// Instance to publish: the one the settings service holds, or the
    /// proposed index when it did not answer
    pub instance_id: u32,
    pub failure: Option<BridgeError>,
}

impl InstanceGrant {
    /// The instance, if the settings service actually assigned it
    pub fn assigned(&self) -> Option<u32> {
        self.failure.is_none().then_some(self.instance_id)
    }

    /// The settings call failed because the bus itself went away
    pub fn lost_connection(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|e| e.is_connection_error() && !matches!(e, BridgeError::Timeout { .. }))
    }
}

fn entry(path: &str, default: &str, description: &str) -> SettingsEntry {
    let mut e: HashMap<String, OwnedValue> = HashMap::new();
    e.insert("path".to_string(), str_owned_value(path));
    e.insert("default".to_string(), str_owned_value(default));
    e.insert("type".to_string(), str_owned_value("s"));
    e.insert("description".to_string(), str_owned_value(description));
    e
}

/// Trailing integer of a `class:instance` string, e.g. `battery:288` -> 288
pub fn parse_class_instance(value: &str) -> Option<u32> {
    let (_, instance) = value.trim().rsplit_once(':')?;
    instance.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::{MemoryBus, SettingsBehavior};

    fn registrar() -> SettingsRegistrar {
        SettingsRegistrar::new(Duration::from_millis(5000), "bridge")
    }

    #[test]
    fn parses_trailing_instance() {
        assert_eq!(parse_class_instance("battery:288"), Some(288));
        assert_eq!(parse_class_instance("temperature: 20"), Some(20));
        assert_eq!(parse_class_instance("battery"), None);
        assert_eq!(parse_class_instance("battery:x"), None);
        assert_eq!(parse_class_instance(""), None);
    }

    #[test]
    fn entries_describe_class_and_name() {
        let entries = registrar().entries(DeviceClass::Environment, 17, "Engine Room");
        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert_eq!(
            owned_value_to_json(first.get("path").unwrap()),
            serde_json::json!("/Settings/Devices/bridge_17/ClassAndVrmInstance")
        );
        assert_eq!(
            owned_value_to_json(first.get("default").unwrap()),
            serde_json::json!("temperature:17")
        );
        assert_eq!(
            owned_value_to_json(entries[1].get("default").unwrap()),
            serde_json::json!("Engine Room")
        );
    }

    #[tokio::test]
    async fn accepted_and_reassigned_instances() {
        let bus = MemoryBus::new();
        let handle = bus.connector().connect().await.unwrap();
        let reg = registrar();

        let id = reg
            .try_register(handle.as_ref(), DeviceClass::Battery, 42, "House")
            .await
            .unwrap();
        assert_eq!(id, 42);

        bus.set_settings_behavior(SettingsBehavior::Fixed("battery:288".to_string()));
        let grant = reg
            .register_instance(handle.as_ref(), DeviceClass::Battery, 42, "House")
            .await;
        assert_eq!(grant.assigned(), Some(288));
        assert_eq!(bus.settings_calls(), 2);
    }

    #[tokio::test]
    async fn failures_fall_back_to_proposed_index() {
        let bus = MemoryBus::new();
        let handle = bus.connector().connect().await.unwrap();
        let reg = registrar();

        bus.set_settings_behavior(SettingsBehavior::Malformed);
        let err = reg
            .try_register(handle.as_ref(), DeviceClass::Tank, 7, "Fuel")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Registration { .. }));
        let grant = reg
            .register_instance(handle.as_ref(), DeviceClass::Tank, 7, "Fuel")
            .await;
        assert_eq!(grant.instance_id, 7);
        assert_eq!(grant.assigned(), None);
        assert!(!grant.lost_connection());

        bus.set_settings_behavior(SettingsBehavior::Fail);
        let grant = reg
            .register_instance(handle.as_ref(), DeviceClass::Tank, 7, "Fuel")
            .await;
        assert_eq!(grant.instance_id, 7);
        assert!(grant.failure.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_settings_service_times_out() {
        let bus = MemoryBus::new();
        let handle = bus.connector().connect().await.unwrap();
        bus.set_settings_behavior(SettingsBehavior::Delay(Duration::from_secs(30)));
        let reg = registrar();

        let err = reg
            .try_register(handle.as_ref(), DeviceClass::Switch, 3, "Deck")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        let grant = reg
            .register_instance(handle.as_ref(), DeviceClass::Switch, 3, "Deck")
            .await;
        assert_eq!(grant.instance_id, 3);
        // a slow settings service is not a lost bus
        assert!(!grant.lost_connection());
    }
}
