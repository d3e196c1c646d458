//! Error types and handling for the bridge
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic D-Bus communication errors
    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// Establishing the bus connection failed
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The bus is in cool-down after a failed connect and the caller asked to be told
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Settings service rejected or mangled an instance registration
    #[error("Registration error: {message}")]
    Registration { message: String },

    /// Duplicate name, failed export or other fatal bus protocol condition
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Create a new D-Bus error
    pub fn dbus<S: Into<String>>(message: S) -> Self {
        BridgeError::DBus {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        BridgeError::Connection {
            message: message.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        BridgeError::NotConnected {
            message: message.into(),
        }
    }

    /// Create a new registration error
    pub fn registration<S: Into<String>>(message: S) -> Self {
        BridgeError::Registration {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        BridgeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        BridgeError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        BridgeError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        BridgeError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error means the bus connection itself is gone
    pub fn is_connection_error(&self) -> bool {
        match self {
            BridgeError::Connection { .. }
            | BridgeError::NotConnected { .. }
            | BridgeError::Timeout { .. } => true,
            BridgeError::DBus { message } => {
                message.contains("connection")
                    || message.contains("Connection")
                    || message.contains("disconnected")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<zbus::Error> for BridgeError {
    fn from(err: zbus::Error) -> Self {
        BridgeError::dbus(err.to_string())
    }
}

impl From<zbus::fdo::Error> for BridgeError {
    fn from(err: zbus::fdo::Error) -> Self {
        BridgeError::dbus(err.to_string())
    }
}

impl From<zbus::zvariant::Error> for BridgeError {
    fn from(err: zbus::zvariant::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BridgeError::config("test config error");
        assert!(matches!(err, BridgeError::Config { .. }));

        let err = BridgeError::protocol("duplicate name");
        assert!(matches!(err, BridgeError::Protocol { .. }));

        let err = BridgeError::validation("field", "test validation error");
        assert!(matches!(err, BridgeError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = BridgeError::validation("battery.min_voltage", "must be positive");
        assert_eq!(
            format!("{}", err),
            "Validation error: battery.min_voltage - must be positive"
        );
    }

    #[test]
    fn connection_classification() {
        assert!(BridgeError::connection("refused").is_connection_error());
        assert!(BridgeError::timeout("hello").is_connection_error());
        assert!(BridgeError::dbus("connection reset by peer").is_connection_error());
        assert!(!BridgeError::protocol("name taken").is_connection_error());
        assert!(!BridgeError::registration("bad reply").is_connection_error());
    }
}
