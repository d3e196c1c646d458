//! Connection lifecycle per device class
//!
//! `Disconnected -> Connecting -> Connected`, `Connecting -> Failed`,
//! `Failed -> Connecting` once the cool-down has elapsed. While failed,
//! updates are dropped (or refused with `NotConnected` when the caller opted
//! in); the first failure of an outage is returned as an error, later ones
//! are only logged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::bus::{BusConnector, BusHandle};
use crate::config::DbusConfig;
use crate::device::DeviceClass;
use crate::error::{BridgeError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed { since: Instant },
}

struct ControllerInner {
    state: ConnectionState,
    handle: Option<Arc<dyn BusHandle>>,
    error_reported: bool,
    shut_down: bool,
}

pub struct ConnectionController {
    class: DeviceClass,
    connector: Arc<dyn BusConnector>,
    cooldown: Duration,
    propagate_not_connected: bool,
    inner: Mutex<ControllerInner>,
    logger: StructuredLogger,
}

impl ConnectionController {
    pub fn new(class: DeviceClass, connector: Arc<dyn BusConnector>, config: &DbusConfig) -> Self {
        Self {
            class,
            connector,
            cooldown: Duration::from_secs(config.reconnect_cooldown_secs),
            propagate_not_connected: config.propagate_not_connected,
            inner: Mutex::new(ControllerInner {
                state: ConnectionState::Disconnected,
                handle: None,
                error_reported: false,
                shut_down: false,
            }),
            logger: get_logger_with_context(
                LogContext::new("connection").with_device_class(class.as_str()),
            ),
        }
    }

    /// Minimum time between attempts after a failure
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    fn not_connected(&self) -> Result<Option<Arc<dyn BusHandle>>> {
        if self.propagate_not_connected {
            Err(BridgeError::not_connected(format!(
                "{} bus is not connected",
                self.class
            )))
        } else {
            Ok(None)
        }
    }

    /// Class-level handle, connecting if needed.
    ///
    /// `Ok(None)` means the update should be dropped: the bus is inside its
    /// cool-down window or the controller was shut down.
    pub async fn acquire(&self) -> Result<Option<Arc<dyn BusHandle>>> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return self.not_connected();
        }
        if let Some(handle) = &inner.handle {
            return Ok(Some(Arc::clone(handle)));
        }
        if let ConnectionState::Failed { since } = inner.state
            && since.elapsed() < self.cooldown
        {
            return self.not_connected();
        }

        inner.state = ConnectionState::Connecting;
        match self.connector.connect().await {
            Ok(handle) => {
                self.logger
                    .info(&format!("Connected to bus: {}", handle.describe()));
                inner.state = ConnectionState::Connected;
                inner.handle = Some(Arc::clone(&handle));
                inner.error_reported = false;
                Ok(Some(handle))
            }
            Err(e) => {
                inner.state = ConnectionState::Failed {
                    since: Instant::now(),
                };
                if !inner.error_reported {
                    inner.error_reported = true;
                    self.logger.error(&format!(
                        "Bus connection failed, retrying in {}s: {}",
                        self.cooldown.as_secs(),
                        e
                    ));
                    Err(e)
                } else {
                    self.logger
                        .debug(&format!("Bus connection still failing: {}", e));
                    self.not_connected()
                }
            }
        }
    }

    /// Open a dedicated handle owning `name` for one device service
    pub async fn open_service(&self, name: &str) -> Result<Arc<dyn BusHandle>> {
        let handle = match self.connector.connect().await {
            Ok(h) => h,
            Err(e) => {
                self.mark_failed(&e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(e) = handle.request_name(name).await {
            self.logger
                .error(&format!("Could not register {}: {}", name, e));
            if let Err(close_err) = handle.close().await {
                self.logger
                    .debug(&format!("Closing rejected handle failed: {}", close_err));
            }
            return Err(e);
        }
        self.logger.debug(&format!("Registered name {}", name));
        Ok(handle)
    }

    /// Drop the class handle and start a cool-down
    pub async fn mark_failed(&self, reason: &str) {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::Failed {
                since: Instant::now(),
            };
            inner.handle.take()
        };
        self.logger.warn(&format!("Bus connection lost: {}", reason));
        if let Some(handle) = handle {
            let _ = handle.close().await;
        }
    }

    /// Close the class handle; later acquires report not-connected
    pub async fn shutdown(&self) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.shut_down = true;
            inner.state = ConnectionState::Disconnected;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            handle.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dbus::MemoryBus;

    fn controller(bus: &MemoryBus, propagate: bool) -> ConnectionController {
        let mut config = Config::default().dbus;
        config.propagate_not_connected = propagate;
        ConnectionController::new(DeviceClass::Battery, bus.connector(), &config)
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_once_then_throttled() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(2);
        let ctl = controller(&bus, false);

        assert!(ctl.acquire().await.is_err());
        assert!(matches!(ctl.state().await, ConnectionState::Failed { .. }));

        // within the cool-down nothing is attempted
        assert!(ctl.acquire().await.unwrap().is_none());
        assert_eq!(bus.connect_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        // second failure is silent
        assert!(ctl.acquire().await.unwrap().is_none());
        assert_eq!(bus.connect_count(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(ctl.acquire().await.unwrap().is_some());
        assert_eq!(ctl.state().await, ConnectionState::Connected);

        // connected: handle is reused
        assert!(ctl.acquire().await.unwrap().is_some());
        assert_eq!(bus.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn opted_in_callers_see_not_connected() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(1);
        let ctl = controller(&bus, true);

        let first = ctl.acquire().await.err().unwrap();
        assert!(matches!(first, BridgeError::Connection { .. }));
        let second = ctl.acquire().await.err().unwrap();
        assert!(matches!(second, BridgeError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn open_service_rejects_taken_names() {
        let bus = MemoryBus::new();
        let ctl = controller(&bus, false);
        let name = "com.victronenergy.battery.bridge_1";
        let _first = ctl.open_service(name).await.unwrap();
        let err = ctl.open_service(name).await.err().unwrap();
        assert!(matches!(err, BridgeError::Protocol { .. }));
        assert_eq!(bus.close_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_disconnects() {
        let bus = MemoryBus::new();
        let ctl = controller(&bus, false);
        assert!(ctl.acquire().await.unwrap().is_some());
        ctl.shutdown().await.unwrap();
        assert_eq!(ctl.state().await, ConnectionState::Disconnected);
        assert!(ctl.acquire().await.unwrap().is_none());
    }
}
