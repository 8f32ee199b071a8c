//! Configuration management for markgate
//!
//! Configuration is resolved in layers: built-in defaults, then an optional TOML
//! file, then `MARKGATE_*` environment variables.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:8080"
//!
//! [lease]
//! default_lease_ms = 30000
//! monitor_tick_ms = 1000
//!
//! [logging]
//! format = "json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::coordinator::CoordinatorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Lease policy and notification buffering
    pub lease: LeaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub enable_cors: bool,
    pub enable_request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            bind_address: defaults.bind_address,
            enable_cors: defaults.enable_cors,
            enable_request_logging: defaults.enable_request_logging,
        }
    }
}

/// Lease policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Shortest lease granted, in milliseconds
    pub min_lease_ms: u64,

    /// Longest lease granted, in milliseconds
    pub max_lease_ms: u64,

    /// Lease used when a caller does not ask for one
    pub default_lease_ms: u64,

    /// How often the lease monitor sweeps
    pub monitor_tick_ms: u64,

    /// Notifier buffer per subscriber
    pub event_capacity: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            min_lease_ms: defaults.min_lease_ms,
            max_lease_ms: defaults.max_lease_ms,
            default_lease_ms: defaults.default_lease_ms,
            monitor_tick_ms: defaults.monitor_tick_ms,
            event_capacity: defaults.event_capacity,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `MARKGATE_*` variables; unparsable values are ignored
    pub fn apply_env(&mut self) {
        if let Some(addr) = env_parse("MARKGATE_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Some(v) = env_parse("MARKGATE_ENABLE_CORS") {
            self.server.enable_cors = v;
        }
        if let Some(v) = env_parse("MARKGATE_REQUEST_LOGGING") {
            self.server.enable_request_logging = v;
        }

        let lease = &mut self.lease;
        if let Some(v) = env_parse("MARKGATE_MIN_LEASE_MS") {
            lease.min_lease_ms = v;
        }
        if let Some(v) = env_parse("MARKGATE_MAX_LEASE_MS") {
            lease.max_lease_ms = v;
        }
        if let Some(v) = env_parse("MARKGATE_DEFAULT_LEASE_MS") {
            lease.default_lease_ms = v;
        }
        if let Some(v) = env_parse("MARKGATE_MONITOR_TICK_MS") {
            lease.monitor_tick_ms = v;
        }
        if let Some(v) = env_parse("MARKGATE_EVENT_CAPACITY") {
            lease.event_capacity = v;
        }

        if let Ok(level) = std::env::var("MARKGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MARKGATE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Server-side view used to build the coordinator
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_address: self.server.bind_address,
            enable_cors: self.server.enable_cors,
            enable_request_logging: self.server.enable_request_logging,
            min_lease_ms: self.lease.min_lease_ms,
            max_lease_ms: self.lease.max_lease_ms,
            default_lease_ms: self.lease.default_lease_ms,
            monitor_tick_ms: self.lease.monitor_tick_ms,
            event_capacity: self.lease.event_capacity,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.to_coordinator_config()
            .validate()
            .context("Invalid lease configuration")?;

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            );
        }

        Ok(())
    }
}
