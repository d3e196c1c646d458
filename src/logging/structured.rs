use std::collections::BTreeMap;

/// Fields attached to every line a [`StructuredLogger`] writes
#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub device_class: Option<String>,
    pub base_path: Option<String>,
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device_class: None,
            base_path: None,
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_device_class(mut self, device_class: &str) -> Self {
        self.device_class = Some(device_class.to_string());
        self
    }

    pub fn with_base_path(mut self, base_path: &str) -> Self {
        self.base_path = Some(base_path.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Logger bound to a component and, optionally, one device.
///
/// Context goes out as real tracing fields, so the JSON formatter emits
/// `component`, `device_class` and `base_path` as separate keys.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
    /// `key=value` pairs of the extra fields, rendered once
    extras: String,
}

macro_rules! log_method {
    ($name:ident, $macro:ident) => {
        pub fn $name(&self, message: &str) {
            let ctx = &self.context;
            tracing::$macro!(
                component = %ctx.component,
                device_class = ctx.device_class.as_deref().unwrap_or(""),
                base_path = ctx.base_path.as_deref().unwrap_or(""),
                extras = %self.extras,
                "{}",
                message
            );
        }
    };
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        let extras = context
            .extra_fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        Self { context, extras }
    }

    log_method!(info, info);
    log_method!(warn, warn);
    log_method!(error, error);
    log_method!(debug, debug);
    log_method!(trace, trace);
}

pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extras_render_in_key_order() {
        let logger = get_logger_with_context(
            LogContext::new("service")
                .with_field("service", "com.victronenergy.tank.bridge_7".to_string())
                .with_field("name", "Fuel".to_string()),
        );
        assert_eq!(
            logger.extras,
            "name=Fuel,service=com.victronenergy.tank.bridge_7"
        );
        assert!(get_logger("bridge").extras.is_empty());
    }
}
