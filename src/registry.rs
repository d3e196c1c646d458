//! Device Instance Registry
//!
//! One registry per device class maps a base path to its [`DeviceInstance`]
//! and the [`BusService`] publishing it. Each base path has its own async
//! slot lock. Creation runs while holding it, and so does every update:
//! [`DeviceRegistry::ensure_instance`] hands out a [`DeviceLease`] that keeps
//! the slot until the update is done, so updates for one device never
//! interleave. A failed creation leaves no instance, no name and no bus
//! state behind; a device whose service hit a protocol error is not retried
//! until the class cool-down has passed.

use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::Instant;

use crate::dbus::{BusHandle, BusService, ConnectionController, SettingsRegistrar};
use crate::device::DeviceClass;
use crate::device::naming::{NameAllocator, category_name, device_index, title_case};
use crate::error::{BridgeError, Result};
use crate::events::BridgeEvent;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};

/// Identity of one bridged device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInstance {
    /// Hash of the base path in `[0, 1000)`
    pub index: u32,
    pub name: String,
    pub base_path: String,
    /// Instance granted by the settings service, if it answered
    pub assigned_instance_id: Option<u32>,
}

impl DeviceInstance {
    /// Instance number published as `/DeviceInstance`
    pub fn device_instance(&self) -> u32 {
        self.assigned_instance_id.unwrap_or(self.index)
    }
}

/// A ready device: identity plus its bus service
pub struct ManagedDevice {
    pub instance: DeviceInstance,
    pub service: BusService,
    category: String,
}

impl ManagedDevice {
    pub fn category(&self) -> &str {
        &self.category
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<ManagedDevice>>>>;

/// Turn to update one device.
///
/// The slot lock is fair, so updates for a base path run one at a time in
/// the order they asked for it. Dropping the lease ends the turn.
pub struct DeviceLease {
    device: Arc<ManagedDevice>,
    _turn: OwnedMutexGuard<Option<Arc<ManagedDevice>>>,
}

impl DeviceLease {
    pub fn device(&self) -> Arc<ManagedDevice> {
        Arc::clone(&self.device)
    }
}

impl Deref for DeviceLease {
    type Target = ManagedDevice;

    fn deref(&self) -> &ManagedDevice {
        &self.device
    }
}

pub struct DeviceRegistry {
    class: DeviceClass,
    connection: Arc<ConnectionController>,
    registrar: SettingsRegistrar,
    service_suffix: String,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    slots: Mutex<HashMap<String, Slot>>,
    /// Ready devices, readable without waiting for an update in progress
    ready: Mutex<HashMap<String, Arc<ManagedDevice>>>,
    /// Base paths whose service failed with a protocol error, and when
    rejected: Mutex<HashMap<String, Instant>>,
    retry_after: Duration,
    names: Mutex<NameAllocator>,
    created: AtomicUsize,
    logger: StructuredLogger,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceRegistry {
    pub fn new(
        class: DeviceClass,
        connection: Arc<ConnectionController>,
        registrar: SettingsRegistrar,
        service_suffix: &str,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let retry_after = connection.cooldown();
        Self {
            class,
            connection,
            registrar,
            service_suffix: service_suffix.to_string(),
            events_tx,
            slots: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            retry_after,
            names: Mutex::new(NameAllocator::new()),
            created: AtomicUsize::new(0),
            logger: get_logger_with_context(
                LogContext::new("registry").with_device_class(class.as_str()),
            ),
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn connection(&self) -> &Arc<ConnectionController> {
        &self.connection
    }

    /// Bus service name for a device index
    pub fn service_name(&self, index: u32) -> String {
        format!(
            "{}.{}_{}",
            self.class.descriptor().service_prefix,
            self.service_suffix,
            index
        )
    }

    /// Fetch the device for `base_path`, creating it on first use, and take
    /// the turn to update it.
    ///
    /// Returns `Ok(None)` when the update is to be dropped: the bus is
    /// unavailable, or the device's service was refused recently.
    pub async fn ensure_instance(
        &self,
        base_path: &str,
        name_hint: Option<&str>,
    ) -> Result<Option<DeviceLease>> {
        let slot = Arc::clone(
            lock(&self.slots)
                .entry(base_path.to_string())
                .or_default(),
        );

        let mut turn = Arc::clone(&slot).lock_owned().await;
        if let Some(device) = turn.as_ref() {
            let device = Arc::clone(device);
            return Ok(Some(DeviceLease {
                device,
                _turn: turn,
            }));
        }

        if self.recently_rejected(base_path) {
            drop(turn);
            self.discard_slot(base_path, &slot);
            self.logger
                .trace(&format!("Service for {} was refused, dropping update", base_path));
            return Ok(None);
        }

        let outcome = match self.connection.acquire().await {
            Ok(Some(handle)) => self
                .create(base_path, name_hint, handle.as_ref())
                .await
                .map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(device)) => {
                let device = Arc::new(device);
                *turn = Some(Arc::clone(&device));
                lock(&self.ready).insert(base_path.to_string(), Arc::clone(&device));
                lock(&self.rejected).remove(base_path);
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(Some(DeviceLease {
                    device,
                    _turn: turn,
                }))
            }
            other => {
                if let Err(BridgeError::Protocol { .. }) = &other {
                    lock(&self.rejected).insert(base_path.to_string(), Instant::now());
                }
                drop(turn);
                self.discard_slot(base_path, &slot);
                other.map(|_| None)
            }
        }
    }

    fn recently_rejected(&self, base_path: &str) -> bool {
        let mut rejected = lock(&self.rejected);
        match rejected.get(base_path) {
            Some(since) if since.elapsed() < self.retry_after => true,
            Some(_) => {
                rejected.remove(base_path);
                false
            }
            None => false,
        }
    }

    /// Remove an empty slot nobody else is waiting on
    fn discard_slot(&self, base_path: &str, slot: &Slot) {
        let mut slots = lock(&self.slots);
        let idle = slots
            .get(base_path)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(base_path);
        }
    }

    async fn create(
        &self,
        base_path: &str,
        name_hint: Option<&str>,
        class_handle: &dyn BusHandle,
    ) -> Result<ManagedDevice> {
        let descriptor = self.class.descriptor();
        let index = device_index(base_path);
        let category = match name_hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hint) => title_case(hint),
            None => category_name(descriptor, base_path),
        };
        let name = lock(&self.names).allocate(&category);

        match self.build(base_path, index, &name, class_handle).await {
            Ok((instance, service)) => {
                self.logger.info(&format!(
                    "Created {} '{}' as {} (instance {})",
                    self.class,
                    instance.name,
                    service.service_name(),
                    instance.device_instance()
                ));
                Ok(ManagedDevice {
                    instance,
                    service,
                    category,
                })
            }
            Err(e) => {
                lock(&self.names).release(&category, &name);
                self.logger
                    .error(&format!("Creating device for {} failed: {}", base_path, e));
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        base_path: &str,
        index: u32,
        name: &str,
        class_handle: &dyn BusHandle,
    ) -> Result<(DeviceInstance, BusService)> {
        let grant = self
            .registrar
            .register_instance(class_handle, self.class, index, name)
            .await;
        if grant.lost_connection()
            && let Some(e) = &grant.failure
        {
            self.connection.mark_failed(&e.to_string()).await;
        }

        let instance = DeviceInstance {
            index,
            name: name.to_string(),
            base_path: base_path.to_string(),
            assigned_instance_id: grant.assigned(),
        };

        let service_name = self.service_name(index);
        let handle = self.connection.open_service(&service_name).await?;
        match BusService::start(
            service_name,
            self.class,
            &instance,
            Arc::clone(&handle),
            self.events_tx.clone(),
        )
        .await
        {
            Ok(service) => Ok((instance, service)),
            Err(e) => {
                let _ = handle.close().await;
                Err(e)
            }
        }
    }

    /// The device for `base_path` if it is ready
    pub fn get(&self, base_path: &str) -> Option<Arc<ManagedDevice>> {
        lock(&self.ready).get(base_path).cloned()
    }

    /// All ready devices
    pub fn devices(&self) -> Vec<Arc<ManagedDevice>> {
        lock(&self.ready).values().cloned().collect()
    }

    /// Number of devices created since startup
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Stop every service and forget all instances. Waits for updates in
    /// progress to finish first.
    pub async fn drain(&self) -> Vec<DeviceInstance> {
        lock(&self.ready).clear();
        lock(&self.rejected).clear();
        let slots: Vec<(String, Slot)> = lock(&self.slots).drain().collect();
        let mut drained = Vec::with_capacity(slots.len());
        for (base_path, slot) in slots {
            let device = slot.lock().await.take();
            if let Some(device) = device {
                if let Err(e) = device.service.stop().await {
                    self.logger
                        .warn(&format!("Stopping service for {} failed: {}", base_path, e));
                }
                drained.push(device.instance.clone());
            }
        }
        lock(&self.names).clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dbus::{MemoryBus, SettingsBehavior};

    fn registry(bus: &MemoryBus, class: DeviceClass) -> DeviceRegistry {
        let config = Config::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionController::new(
            class,
            bus.connector(),
            &config.dbus,
        ));
        DeviceRegistry::new(
            class,
            connection,
            SettingsRegistrar::from_config(&config.dbus),
            &config.dbus.service_suffix,
            tx,
        )
    }

    async fn fetch(reg: &DeviceRegistry, base_path: &str) -> Result<Option<Arc<ManagedDevice>>> {
        Ok(reg
            .ensure_instance(base_path, None)
            .await?
            .map(|lease| lease.device()))
    }

    #[tokio::test]
    async fn same_base_path_same_instance() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Tank);
        let a = fetch(&reg, "tanks.freshWater.0").await.unwrap().unwrap();
        let b = fetch(&reg, "tanks.freshWater.0").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.instance.name, "Fresh Water");
        assert_eq!(a.instance.index, device_index("tanks.freshWater.0"));
        assert_eq!(reg.created_count(), 1);
        assert_eq!(bus.settings_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creation_yields_one_instance() {
        let bus = MemoryBus::new();
        bus.set_settings_behavior(SettingsBehavior::Delay(Duration::from_millis(200)));
        let reg = registry(&bus, DeviceClass::Battery);

        let (a, b, c) = tokio::join!(
            fetch(&reg, "electrical.batteries.house"),
            fetch(&reg, "electrical.batteries.house"),
            fetch(&reg, "electrical.batteries.house"),
        );
        let a = a.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap().unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap().unwrap()));
        assert_eq!(reg.created_count(), 1);
        assert_eq!(bus.settings_calls(), 1);
        assert_eq!(bus.owned_names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_serializes_updates_for_one_device() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Switch);
        let base = "electrical.switches.deck";
        fetch(&reg, base).await.unwrap().unwrap();

        let order = Mutex::new(Vec::new());
        let first = async {
            let _lease = reg.ensure_instance(base, None).await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            lock(&order).push("first");
        };
        let second = async {
            tokio::task::yield_now().await;
            let _lease = reg.ensure_instance(base, None).await.unwrap().unwrap();
            lock(&order).push("second");
        };
        tokio::join!(first, second);
        assert_eq!(*lock(&order), vec!["first", "second"]);

        // lookups do not wait for a held lease
        let lease = reg.ensure_instance(base, None).await.unwrap().unwrap();
        assert!(reg.get(base).is_some());
        assert_eq!(reg.devices().len(), 1);
        drop(lease);
    }

    #[tokio::test]
    async fn second_device_of_category_is_numbered() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Tank);
        let a = fetch(&reg, "tanks.fuel.0").await.unwrap().unwrap();
        let b = fetch(&reg, "tanks.fuel.1").await.unwrap().unwrap();
        assert_eq!(a.instance.name, "Fuel");
        assert_eq!(b.instance.name, "Fuel 2");
        assert_eq!(reg.devices().len(), 2);
    }

    #[tokio::test]
    async fn hint_overrides_path_name() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Switch);
        let d = reg
            .ensure_instance("electrical.switches.3", Some("anchorLight"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.instance.name, "Anchor Light");
    }

    #[tokio::test]
    async fn settings_failure_degrades_to_index() {
        let bus = MemoryBus::new();
        bus.set_settings_behavior(SettingsBehavior::Fail);
        let reg = registry(&bus, DeviceClass::Battery);
        let d = fetch(&reg, "electrical.batteries.starter")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.instance.assigned_instance_id, None);
        assert_eq!(d.instance.device_instance(), d.instance.index);
        assert_eq!(
            d.service.get_value("/DeviceInstance"),
            Some(serde_json::json!(d.instance.index))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_service_is_not_retried_before_cooldown() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Tank);
        // occupy the name the registry will ask for
        let squatter = bus.connector().connect().await.unwrap();
        squatter
            .request_name(&reg.service_name(device_index("tanks.fuel.0")))
            .await
            .unwrap();

        let err = reg.ensure_instance("tanks.fuel.0", None).await.err().unwrap();
        assert!(matches!(err, BridgeError::Protocol { .. }));
        assert!(reg.get("tanks.fuel.0").is_none());
        assert!(lock(&reg.slots).is_empty());
        assert_eq!(reg.created_count(), 0);

        for _ in 0..9 {
            assert!(fetch(&reg, "tanks.fuel.0").await.unwrap().is_none());
        }
        assert_eq!(bus.settings_calls(), 1);

        squatter.close().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let d = fetch(&reg, "tanks.fuel.0").await.unwrap().unwrap();
        // the name was released with the failed attempt
        assert_eq!(d.instance.name, "Fuel");
        assert_eq!(bus.settings_calls(), 2);
    }

    #[tokio::test]
    async fn drain_stops_services() {
        let bus = MemoryBus::new();
        let reg = registry(&bus, DeviceClass::Environment);
        fetch(&reg, "environment.inside").await.unwrap().unwrap();
        assert_eq!(bus.owned_names().len(), 1);
        let drained = reg.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "Inside");
        assert!(bus.owned_names().is_empty());
        assert!(reg.get("environment.inside").is_none());
    }
}
