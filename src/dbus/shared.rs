use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::bus::{BusHandle, ItemChange};
use super::items::ServiceProperty;
use super::util::coerce;
use crate::device::DeviceClass;
use crate::events::BridgeEvent;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::normalize::to_upstream;

/// SetValue accepted
pub const SET_OK: i32 = 0;
/// SetValue on a read-only property
pub const SET_READ_ONLY: i32 = -1;
/// SetValue outside the declared `[min, max]`
pub const SET_OUT_OF_RANGE: i32 = -2;
/// SetValue with a value that cannot be converted to the property type
pub const SET_TYPE_MISMATCH: i32 = -3;
/// SetValue on a path the service does not carry
pub const SET_UNKNOWN_PATH: i32 = -4;

/// State shared between a service and the bus objects exported for it
pub struct ServiceShared {
    pub(crate) class: DeviceClass,
    pub(crate) base_path: String,
    pub(crate) properties: BTreeMap<String, ServiceProperty>,
    pub(crate) events_tx: mpsc::UnboundedSender<BridgeEvent>,
    pub(crate) handle: Option<Arc<dyn BusHandle>>,
    pub(crate) logger: StructuredLogger,
}

impl ServiceShared {
    pub fn new(
        class: DeviceClass,
        base_path: String,
        name: String,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("dbus")
                .with_device_class(class.as_str())
                .with_base_path(&base_path)
                .with_field("name", name),
        );
        Self {
            class,
            base_path,
            properties: BTreeMap::new(),
            events_tx,
            handle: None,
            logger,
        }
    }

    /// Validate and store a remote write. Returns the change to announce.
    fn write_remote(
        &mut self,
        path: &str,
        incoming: &serde_json::Value,
    ) -> std::result::Result<ItemChange, i32> {
        let Some(prop) = self.properties.get_mut(path) else {
            return Err(SET_UNKNOWN_PATH);
        };
        if !prop.writable {
            return Err(SET_READ_ONLY);
        }
        let value = coerce(prop.kind, incoming).ok_or(SET_TYPE_MISMATCH)?;
        if let Some(v) = value.as_f64()
            && (prop.min.is_some_and(|min| v < min) || prop.max.is_some_and(|max| v > max))
        {
            return Err(SET_OUT_OF_RANGE);
        }
        prop.value = value;
        Ok(ItemChange::from_property(prop))
    }

    fn value_changed_event(&self, change: &ItemChange) -> BridgeEvent {
        let source_path = self
            .class
            .descriptor()
            .property(&change.path)
            .and_then(|def| def.source_suffix)
            .map(|suffix| format!("{}.{}", self.base_path, suffix));
        let value = if source_path.is_some() {
            to_upstream(self.class, &change.path, &change.value)
        } else {
            change.value.clone()
        };
        BridgeEvent::ValueChanged {
            device_class: self.class,
            base_path: self.base_path.clone(),
            property: change.path.clone(),
            path: source_path,
            value,
        }
    }
}

/// Lock the shared state, recovering the data if a holder panicked
pub(crate) fn lock_shared(shared: &Mutex<ServiceShared>) -> MutexGuard<'_, ServiceShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SetValue entry point shared by the bus objects and [`super::BusService`].
///
/// On success the change is announced on the bus and reported to the
/// caller's event channel.
pub(crate) async fn apply_set_value(
    shared: &Arc<Mutex<ServiceShared>>,
    path: &str,
    incoming: serde_json::Value,
) -> i32 {
    let (change, event, handle, events_tx, logger) = {
        let mut state = lock_shared(shared);
        match state.write_remote(path, &incoming) {
            Ok(change) => {
                let event = state.value_changed_event(&change);
                (
                    change,
                    event,
                    state.handle.clone(),
                    state.events_tx.clone(),
                    state.logger.clone(),
                )
            }
            Err(code) => {
                state.logger.debug(&format!(
                    "Rejected SetValue on {} with {}: code {}",
                    path, incoming, code
                ));
                return code;
            }
        }
    };

    logger.info(&format!("Remote write {} = {}", path, change.value));
    if let Some(handle) = handle
        && let Err(e) = handle.emit_changes(std::slice::from_ref(&change)).await
    {
        logger.warn(&format!("Failed to emit change for {}: {}", path, e));
    }
    let _ = events_tx.send(event);
    SET_OK
}
