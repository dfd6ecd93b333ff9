//! # Configuration Management
//!
//! Centralized configuration for the realm protocol core.
//!
//! This module provides structured configuration for the client-facing
//! server, the backend link, world geometry, and handoff timing.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Timing defaults
//! The timing defaults mirror the values the protocol was tuned with in
//! production: a 20 ms dispatch tick, three frames per connection per tick,
//! a 60 s handoff staleness window swept every 30 s, and fixed 10 s backend
//! reconnect/keepalive intervals.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client-facing listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend link configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// World geometry and areas of responsibility
    #[serde(default)]
    pub world: WorldConfig,

    /// Handoff timing
    #[serde(default)]
    pub handoff: HandoffConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("REALM_PROTOCOL_LISTEN_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("REALM_PROTOCOL_BACKEND_ADDRESS") {
            config.backend.address = addr;
        }

        if let Ok(user) = std::env::var("REALM_PROTOCOL_BACKEND_USER") {
            config.backend.user = user;
        }

        if let Ok(password) = std::env::var("REALM_PROTOCOL_BACKEND_PASSWORD") {
            config.backend.password = password;
        }

        if let Ok(tick) = std::env::var("REALM_PROTOCOL_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.server.tick_interval = Duration::from_millis(val);
            }
        }

        if let Ok(frames) = std::env::var("REALM_PROTOCOL_FRAMES_PER_TICK") {
            if let Ok(val) = frames.parse::<u32>() {
                config.server.frames_per_tick = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the whole configuration; empty result means valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.backend.validate());
        errors.extend(self.world.validate());
        errors.extend(self.handoff.validate());
        errors.extend(self.logging.validate());
        errors
    }
}

/// Client-facing listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for client connections
    pub address: String,

    /// Maximum concurrent client connections
    pub max_connections: usize,

    /// Dispatch tick interval
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Round-robin fairness bound: frames dispatched per connection per
    /// tick, so one spammy client cannot starve the rest.
    pub frames_per_tick: u32,

    /// Read buffer size per connection, in bytes
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:5121"),
            max_connections: 4096,
            tick_interval: Duration::from_millis(20),
            frames_per_tick: 3,
            read_buffer_size: 4096,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections cannot be 0".to_string());
        }

        if self.frames_per_tick == 0 {
            errors.push("Frames per tick cannot be 0".to_string());
        } else if self.frames_per_tick > 64 {
            errors.push(format!(
                "Frames per tick suspiciously high: {} (fairness bound is meaningless above 64)",
                self.frames_per_tick
            ));
        }

        if self.tick_interval.is_zero() {
            errors.push("Tick interval cannot be 0".to_string());
        } else if self.tick_interval > Duration::from_secs(1) {
            errors.push("Tick interval above 1s makes clients visibly laggy".to_string());
        }

        if self.read_buffer_size < 256 {
            errors.push("Read buffer too small (minimum: 256 bytes)".to_string());
        }

        errors
    }
}

/// Backend link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Address of the backend process
    pub address: String,

    /// Credentials presented in the connect handshake
    pub user: String,
    pub password: String,

    /// This server's own public address, forwarded to the backend so it
    /// can route clients here
    pub public_ip: String,
    pub public_port: u16,

    /// Fixed reconnect retry interval; there is exactly one backend link,
    /// so no backoff is applied
    #[serde(with = "duration_serde")]
    pub retry_interval: Duration,

    /// Keepalive ping interval while the link is ready
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:6121"),
            user: String::from("realm01"),
            password: String::from("changeme"),
            public_ip: String::from("127.0.0.1"),
            public_port: 5121,
            retry_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

impl BackendConfig {
    /// Public IPv4 as the raw u32 the wire format carries.
    pub fn public_ip_u32(&self) -> Result<u32> {
        self.public_ip
            .parse::<Ipv4Addr>()
            .map(u32::from)
            .map_err(|e| ProtocolError::ConfigError(format!("Bad public_ip: {e}")))
    }

    /// Validate backend configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Backend address cannot be empty".to_string());
        }

        if self.user.is_empty() {
            errors.push("Backend user cannot be empty".to_string());
        } else if self.user.len() > 23 {
            errors.push("Backend user too long (wire field is 24 bytes, NUL-terminated)".to_string());
        }

        if self.password == "changeme" {
            errors.push("WARNING: Backend password is the default - change it".to_string());
        } else if self.password.len() > 23 {
            errors.push("Backend password too long (wire field is 24 bytes, NUL-terminated)".to_string());
        }

        if self.public_ip.parse::<Ipv4Addr>().is_err() {
            errors.push(format!("public_ip is not a valid IPv4 address: {}", self.public_ip));
        }

        if self.retry_interval < Duration::from_secs(1) {
            errors.push("Backend retry interval below 1s hammers the backend".to_string());
        }

        if self.keepalive_interval.is_zero() {
            errors.push("Keepalive interval cannot be 0".to_string());
        }

        errors
    }
}

/// World geometry and areas of responsibility
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Map ids this server is responsible for; announced to the backend
    /// on every successful connect
    pub maps: Vec<u16>,

    /// Broadcast rectangle half-width, in cells
    pub area_radius: i16,

    /// Shrink applied to chat-adjacent area broadcasts
    pub chat_shrink: i16,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            maps: vec![0],
            area_radius: 14,
            chat_shrink: 5,
        }
    }
}

impl WorldConfig {
    /// Validate world configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.maps.is_empty() {
            errors.push("World must declare at least one map of responsibility".to_string());
        }

        if self.area_radius <= 0 {
            errors.push("Area radius must be positive".to_string());
        }

        if self.chat_shrink < 0 || self.chat_shrink >= self.area_radius {
            errors.push("Chat shrink must be in 0..area_radius".to_string());
        }

        errors
    }
}

/// Handoff timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Age past which an auth node is considered stale
    #[serde(with = "duration_serde")]
    pub stale_after: Duration,

    /// How often the sweeper runs
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl HandoffConfig {
    /// Validate handoff configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.stale_after < Duration::from_secs(5) {
            errors.push("Staleness window below 5s evicts healthy handoffs".to_string());
        }

        if self.sweep_interval.is_zero() {
            errors.push("Sweep interval cannot be 0".to_string());
        } else if self.sweep_interval > self.stale_after {
            errors.push("Sweep interval should not exceed the staleness window".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("realm-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
