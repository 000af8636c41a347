use kd_telemetry::logging::{self, LogFormat};

#[test]
fn test_repeated_init_is_noop() {
    logging::init("test-service", "debug", false);
    // The global subscriber is set by now; further calls must not panic.
    assert!(!logging::init_with_format("test-service", "info", LogFormat::Json));
    assert!(!logging::init("test-service", "info", false));

    tracing::info!(key = "value", "log line after init");
}

#[test]
fn test_format_from_flag() {
    assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
    assert_eq!(LogFormat::from_json_flag(false), LogFormat::Human);
}

#[test]
fn test_invalid_default_level_falls_back() {
    // An unparsable directive must not panic.
    let _ = logging::filter_for("kd_core=[[[");
}
