//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use realm_protocol::config::{BackendConfig, NetworkConfig};
use std::time::Duration;
use tracing::Level;

/// Defaults carry the placeholder backend password, which validation
/// flags; everything else must be clean.
#[test]
fn test_default_config_validates_except_password() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert_eq!(errors.len(), 1, "unexpected errors: {errors:?}");
    assert!(errors[0].contains("password"));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_frames_per_tick() {
    let mut config = NetworkConfig::default();
    config.server.frames_per_tick = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Frames per tick cannot be 0")));
}

#[test]
fn test_excessive_frames_per_tick() {
    let mut config = NetworkConfig::default();
    config.server.frames_per_tick = 1000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("suspiciously high")));
}

#[test]
fn test_zero_tick_interval() {
    let mut config = NetworkConfig::default();
    config.server.tick_interval = Duration::ZERO;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Tick interval cannot be 0")));
}

#[test]
fn test_tiny_read_buffer() {
    let mut config = NetworkConfig::default();
    config.server.read_buffer_size = 64;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Read buffer too small")));
}

#[test]
fn test_backend_user_exceeding_wire_field() {
    let mut config = NetworkConfig::default();
    config.backend.user = "a".repeat(30);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("user too long")));
}

#[test]
fn test_invalid_public_ip() {
    let mut config = NetworkConfig::default();
    config.backend.public_ip = String::from("not-an-address");

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("not a valid IPv4 address")));
    assert!(config.backend.public_ip_u32().is_err());
}

#[test]
fn test_public_ip_wire_conversion() {
    let config = BackendConfig {
        public_ip: String::from("10.0.0.1"),
        ..BackendConfig::default()
    };
    assert_eq!(config.public_ip_u32().unwrap(), 0x0a00_0001);
}

#[test]
fn test_hammering_retry_interval() {
    let mut config = NetworkConfig::default();
    config.backend.retry_interval = Duration::from_millis(100);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("hammers the backend")));
}

#[test]
fn test_world_without_maps() {
    let mut config = NetworkConfig::default();
    config.world.maps.clear();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("at least one map")));
}

#[test]
fn test_chat_shrink_must_fit_inside_radius() {
    let mut config = NetworkConfig::default();
    config.world.area_radius = 5;
    config.world.chat_shrink = 5;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Chat shrink must be in 0..area_radius")));
}

#[test]
fn test_sweep_interval_exceeding_staleness_window() {
    let mut config = NetworkConfig::default();
    config.handoff.sweep_interval = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("should not exceed the staleness window")));
}

#[test]
fn test_toml_parsing_with_partial_sections() {
    let toml = r#"
        [server]
        address = "0.0.0.0:6900"
        frames_per_tick = 5

        [world]
        maps = [1, 2, 7]
    "#;
    let config = NetworkConfig::from_toml(toml).expect("partial TOML parses");
    assert_eq!(config.server.address, "0.0.0.0:6900");
    assert_eq!(config.server.frames_per_tick, 5);
    assert_eq!(config.world.maps, vec![1, 2, 7]);
    // untouched sections keep their defaults
    assert_eq!(config.backend.address, "127.0.0.1:6121");
    assert_eq!(config.handoff.stale_after, Duration::from_secs(60));
}

#[test]
fn test_durations_travel_as_milliseconds() {
    let toml = r#"
        [server]
        tick_interval = 50

        [handoff]
        stale_after = 90000
        sweep_interval = 15000
    "#;
    let config = NetworkConfig::from_toml(toml).expect("TOML parses");
    assert_eq!(config.server.tick_interval, Duration::from_millis(50));
    assert_eq!(config.handoff.stale_after, Duration::from_secs(90));
    assert_eq!(config.handoff.sweep_interval, Duration::from_secs(15));
}

#[test]
fn test_log_level_parses_from_text() {
    let toml = r#"
        [logging]
        log_level = "debug"
    "#;
    let config = NetworkConfig::from_toml(toml).expect("TOML parses");
    assert_eq!(config.logging.log_level, Level::DEBUG);
}

#[test]
fn test_invalid_log_level_is_an_error() {
    let toml = r#"
        [logging]
        log_level = "loud"
    "#;
    assert!(NetworkConfig::from_toml(toml).is_err());
}

#[test]
fn test_example_config_round_trips() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).expect("example config parses");
    assert_eq!(parsed.server.frames_per_tick, 3);
    assert_eq!(parsed.backend.keepalive_interval, Duration::from_secs(10));
}

#[test]
fn test_malformed_toml_reports_config_error() {
    let err = NetworkConfig::from_toml("[server\naddress=").unwrap_err();
    assert!(err.to_string().contains("TOML"));
}
