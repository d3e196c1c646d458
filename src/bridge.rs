//! Update pipeline
//!
//! [`Bridge`] owns one [`DeviceClassClient`] per enabled device class. An
//! update flows through the normalizer, the class registry (create or fetch
//! the device) and the device's bus service; battery voltage/current
//! updates additionally drive the energy accumulator. The device lease is
//! held until the update is fully applied, so derived values and battery
//! accounting see the updates of one device in arrival order.

use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dbus::{BusConnector, BusService, ConnectionController, SettingsRegistrar};
use crate::device::DeviceClass;
use crate::energy::{EnergyAccumulator, HistoryRecord};
use crate::error::Result;
use crate::events::BridgeEvent;
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::normalize::{fluid_type, normalize, temperature_type};
use crate::persistence::PersistenceManager;
use crate::registry::{DeviceInstance, DeviceRegistry, ManagedDevice};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Entry point for the updates of one device class
pub struct DeviceClassClient {
    class: DeviceClass,
    registry: DeviceRegistry,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    energy: Arc<Mutex<EnergyAccumulator>>,
    /// Tanks whose source reports a volume; `/Remaining` is not derived for them
    reported_volume: Mutex<HashSet<String>>,
    logger: StructuredLogger,
}

impl DeviceClassClient {
    pub fn new(
        class: DeviceClass,
        config: &Config,
        connector: Arc<dyn BusConnector>,
        energy: Arc<Mutex<EnergyAccumulator>>,
        events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let connection = Arc::new(ConnectionController::new(class, connector, &config.dbus));
        let registry = DeviceRegistry::new(
            class,
            connection,
            SettingsRegistrar::from_config(&config.dbus),
            &config.dbus.service_suffix,
            events_tx.clone(),
        );
        Self {
            class,
            registry,
            events_tx,
            energy,
            reported_volume: Mutex::new(HashSet::new()),
            logger: get_logger_with_context(
                LogContext::new("bridge").with_device_class(class.as_str()),
            ),
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Apply one upstream update
    pub async fn apply_update(&self, path: &str, value: Value) -> Result<()> {
        self.apply_update_at(path, value, now_ms()).await
    }

    /// Apply one upstream update observed at `now_ms`
    pub async fn apply_update_at(&self, path: &str, value: Value, now_ms: i64) -> Result<()> {
        let Some(update) = normalize(self.class, path, &value) else {
            self.logger
                .trace(&format!("Ignoring {} = {}", path, value));
            return Ok(());
        };

        let Some(device) = self.registry.ensure_instance(&update.base_path, None).await? else {
            self.logger
                .trace(&format!("Bus unavailable, dropping {}", path));
            return Ok(());
        };

        let service = &device.service;
        if update.property == "/Remaining" {
            lock(&self.reported_volume).insert(update.base_path.clone());
        }
        service.export(update.property, update.value.clone()).await?;

        match self.class {
            DeviceClass::Battery => {
                if matches!(update.property, "/Dc/0/Voltage" | "/Dc/0/Current") {
                    self.battery_derived(service, &update.base_path, now_ms)
                        .await?;
                }
            }
            DeviceClass::Tank => self.tank_derived(service, &update.base_path).await?,
            DeviceClass::Environment => {
                if service.get_value("/TemperatureType").is_none() {
                    service
                        .export("/TemperatureType", json!(temperature_type(&update.base_path)))
                        .await?;
                }
            }
            DeviceClass::Switch => {}
        }

        self.data_updated(&device, update.property, &update.value);
        Ok(())
    }

    async fn battery_derived(&self, service: &BusService, base_path: &str, now_ms: i64) -> Result<()> {
        let voltage = service.get_value("/Dc/0/Voltage").and_then(|v| v.as_f64());
        let current = service.get_value("/Dc/0/Current").and_then(|v| v.as_f64());
        let (Some(voltage), Some(current)) = (voltage, current) else {
            return Ok(());
        };

        service.export("/Dc/0/Power", json!(voltage * current)).await?;
        let record = lock(&self.energy).accumulate(base_path, voltage, current, now_ms);
        export_history(service, &record).await
    }

    async fn tank_derived(&self, service: &BusService, base_path: &str) -> Result<()> {
        if service.get_value("/FluidType").is_none()
            && let Some(code) = fluid_type(base_path)
        {
            service.export("/FluidType", json!(code)).await?;
        }
        if lock(&self.reported_volume).contains(base_path) {
            return Ok(());
        }
        let level = service.get_value("/Level").and_then(|v| v.as_f64());
        let capacity = service.get_value("/Capacity").and_then(|v| v.as_f64());
        if let (Some(level), Some(capacity)) = (level, capacity) {
            service
                .export("/Remaining", json!(capacity * level / 100.0))
                .await?;
        }
        Ok(())
    }

    fn data_updated(&self, device: &ManagedDevice, property: &str, value: &Value) {
        let label = device
            .service
            .get_text(property)
            .unwrap_or_else(|| property.to_string());
        let shown = match value.as_f64() {
            Some(v) if value.is_f64() => format!("{:.2}", v),
            _ => value.to_string(),
        };
        let _ = self.events_tx.send(BridgeEvent::DataUpdated {
            category: device.category().to_string(),
            text: format!("{}: {} {}", device.instance.name, label, shown),
        });
    }

    /// Stop every device of this class and close the class connection
    pub async fn shutdown(&self) -> Result<Vec<DeviceInstance>> {
        let drained = self.registry.drain().await;
        self.registry.connection().shutdown().await?;
        self.logger.info(&format!(
            "Stopped {} {} device(s)",
            drained.len(),
            self.class
        ));
        Ok(drained)
    }
}

async fn export_history(service: &BusService, record: &HistoryRecord) -> Result<()> {
    if let Some(min) = record.minimum_voltage {
        service.export("/History/MinimumVoltage", json!(min)).await?;
    }
    if let Some(max) = record.maximum_voltage {
        service.export("/History/MaximumVoltage", json!(max)).await?;
    }
    service
        .export("/History/ChargedEnergy", json!(record.charged_energy_kwh))
        .await?;
    service
        .export(
            "/History/DischargedEnergy",
            json!(record.discharged_energy_kwh),
        )
        .await?;
    service
        .export("/History/TotalAhDrawn", json!(record.total_ah_drawn))
        .await
}

/// All device-class clients plus shared battery accounting
pub struct Bridge {
    clients: HashMap<DeviceClass, DeviceClassClient>,
    energy: Arc<Mutex<EnergyAccumulator>>,
    persistence: Option<Mutex<PersistenceManager>>,
    logger: StructuredLogger,
}

impl Bridge {
    /// Build the bridge and the channel its events are delivered on
    pub fn new(
        config: Config,
        connector: Arc<dyn BusConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let logger = get_logger("bridge");
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut accumulator = EnergyAccumulator::new(&config.battery);
        let persistence = config.battery.history_file.as_deref().map(|file| {
            let mut pm = PersistenceManager::new(file);
            if let Err(e) = pm.load() {
                logger.error(&format!(
                    "Ignoring unreadable history file {}: {}",
                    pm.file_path(),
                    e
                ));
            }
            for (base_path, record) in pm.history() {
                accumulator.restore(base_path, record.clone());
            }
            Mutex::new(pm)
        });
        let energy = Arc::new(Mutex::new(accumulator));

        let clients = DeviceClass::ALL
            .into_iter()
            .filter(|class| config.classes.is_enabled(*class))
            .map(|class| {
                (
                    class,
                    DeviceClassClient::new(
                        class,
                        &config,
                        Arc::clone(&connector),
                        Arc::clone(&energy),
                        events_tx.clone(),
                    ),
                )
            })
            .collect();

        (
            Self {
                clients,
                energy,
                persistence,
                logger,
            },
            events_rx,
        )
    }

    pub fn client(&self, class: DeviceClass) -> Option<&DeviceClassClient> {
        self.clients.get(&class)
    }

    /// Route an update to its class client. Solar and alternator currents
    /// only feed the battery accounting and create no device.
    pub async fn apply_update(&self, path: &str, value: Value, class: DeviceClass) -> Result<()> {
        self.apply_update_at(path, value, class, now_ms()).await
    }

    pub async fn apply_update_at(
        &self,
        path: &str,
        value: Value,
        class: DeviceClass,
        now_ms: i64,
    ) -> Result<()> {
        if lock(&self.energy).observe(path, &value) {
            self.logger
                .trace(&format!("Auxiliary current {} = {}", path, value));
            return Ok(());
        }
        match self.clients.get(&class) {
            Some(client) => client.apply_update_at(path, value, now_ms).await,
            None => {
                self.logger
                    .trace(&format!("{} is disabled, dropping {}", class, path));
                Ok(())
            }
        }
    }

    /// Current history of one battery
    pub fn history(&self, base_path: &str) -> Option<HistoryRecord> {
        lock(&self.energy).history(base_path).cloned()
    }

    /// Write all history records to the configured file
    pub fn persist_history(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let snapshot = lock(&self.energy).snapshot();
        let mut pm = lock(persistence);
        pm.set_history(snapshot);
        pm.save()
    }

    /// Persist history and tear down every device
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.persist_history() {
            self.logger.error(&format!("Saving history failed: {}", e));
        }
        for client in self.clients.values() {
            client.shutdown().await?;
        }
        self.logger.info("Bridge stopped");
        Ok(())
    }
}
