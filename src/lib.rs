//! # Venus Bridge - telemetry to Victron Venus OS D-Bus devices
//!
//! Turns generic `(path, value)` telemetry updates into virtual Venus OS
//! devices (battery monitors, tank sensors, switches, temperature sensors)
//! that displays and VRM see exactly like native hardware.
//!
//! ## Features
//!
//! - **Async-first**: Tokio runtime, one bus connection per device service
//! - **D-Bus Integration**: `com.victronenergy.BusItem` contract via zbus
//! - **Stable instances**: deterministic indices, settings-service registration
//! - **Battery history**: energy and amp-hour accounting, persisted as JSON
//! - **Configuration**: YAML-based configuration with validation
//! - **Dry run**: in-process bus for running without D-Bus
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `device`: Device-class descriptor table, instance index and naming
//! - `normalize`: Value normalization per device class
//! - `registry`: Device instance registry
//! - `dbus`: Property export engine, settings registrar, connection lifecycle
//! - `energy`: Battery energy accumulator
//! - `persistence`: History persistence
//! - `bridge`: Update pipeline and event channel

pub mod bridge;
pub mod config;
pub mod dbus;
pub mod device;
pub mod energy;
pub mod error;
pub mod events;
pub mod logging;
pub mod normalize;
pub mod persistence;
pub mod registry;

// Re-export commonly used types
pub use bridge::{Bridge, DeviceClassClient};
pub use config::Config;
pub use device::DeviceClass;
pub use error::{BridgeError, Result};
pub use events::BridgeEvent;
