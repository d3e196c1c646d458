use tracing::Level;
use venus_bridge::logging::{LogContext, get_logger_with_context, parse_log_level};

#[test]
fn parse_levels_case_insensitively() {
    assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
    assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
    assert!(parse_log_level("chatty").is_err());
}

#[test]
fn logger_without_subscriber_does_not_panic() {
    let logger = get_logger_with_context(
        LogContext::new("registry")
            .with_device_class("tank")
            .with_base_path("tanks.fuel.0"),
    );
    logger.info("created");
    logger.trace("ignored");
}
