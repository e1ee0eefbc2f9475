//! Tests for logging configuration and format parsing

use orderguard::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("ERROR"), Level::ERROR);
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("Debug"), Level::DEBUG);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
    assert_eq!(parse_level("INFO"), Level::INFO);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_span_macros_build_spans() {
    let dispatch = orderguard::dispatch_span!(channel = "orders", offset = 3u64);
    let broker = orderguard::broker_span!(operation = "connect");
    let lifecycle = orderguard::lifecycle_span!(group = "order-group");

    // Without a subscriber the spans are disabled but still constructible
    let _ = (dispatch, broker, lifecycle);
}
