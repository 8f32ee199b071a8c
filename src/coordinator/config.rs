//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

/// Configuration for the Coordinator server and its lease policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Shortest lease a caller can obtain, in milliseconds
    pub min_lease_ms: u64,

    /// Longest lease a caller can obtain, in milliseconds
    pub max_lease_ms: u64,

    /// Lease used when the caller does not ask for one
    pub default_lease_ms: u64,

    /// Lease monitor tick in milliseconds
    pub monitor_tick_ms: u64,

    /// Events buffered per notification subscriber
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(DEFAULT_BIND_ADDRESS),
            enable_cors: true,
            enable_request_logging: true,
            min_lease_ms: 2_000,
            max_lease_ms: 120_000,
            default_lease_ms: 30_000,
            monitor_tick_ms: 1_000,
            event_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new config builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_lease_ms == 0 {
            return Err(ConfigError::invalid("min_lease_ms", "Must be at least 1ms"));
        }

        if self.min_lease_ms > self.max_lease_ms {
            return Err(ConfigError::invalid(
                "min_lease_ms",
                "Minimum lease must not exceed maximum lease",
            ));
        }

        if !(self.min_lease_ms..=self.max_lease_ms).contains(&self.default_lease_ms) {
            return Err(ConfigError::invalid(
                "default_lease_ms",
                "Default lease must lie within [min_lease_ms, max_lease_ms]",
            ));
        }

        if self.monitor_tick_ms == 0 {
            return Err(ConfigError::invalid("monitor_tick_ms", "Tick must be positive"));
        }

        if self.monitor_tick_ms >= self.min_lease_ms {
            return Err(ConfigError::invalid(
                "monitor_tick_ms",
                "Tick must be shorter than the minimum lease",
            ));
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("event_capacity", "Must buffer at least 1 event"));
        }

        Ok(())
    }

    /// Lease for a request, clamped to the configured bounds
    pub fn clamp_lease(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_lease_ms)
            .clamp(self.min_lease_ms, self.max_lease_ms);
        Duration::from_millis(ms)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms)
    }

    /// How long evicted holders are remembered for `LeaseExpired` answers
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.max_lease_ms)
    }
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    bind_address: Option<SocketAddr>,
    enable_cors: Option<bool>,
    enable_request_logging: Option<bool>,
    min_lease_ms: Option<u64>,
    max_lease_ms: Option<u64>,
    default_lease_ms: Option<u64>,
    monitor_tick_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl CoordinatorConfigBuilder {
    /// Set bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(
            addr.parse()
                .map_err(|_| ConfigError::invalid("bind_address", format!("Invalid address: {addr}")))?,
        );
        Ok(self)
    }

    /// Enable/disable CORS
    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = Some(enable);
        self
    }

    /// Enable/disable request logging
    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.enable_request_logging = Some(enable);
        self
    }

    /// Set lease bounds in milliseconds
    pub fn lease_bounds_ms(mut self, min: u64, max: u64) -> Self {
        self.min_lease_ms = Some(min);
        self.max_lease_ms = Some(max);
        self
    }

    /// Set the default lease in milliseconds
    pub fn default_lease_ms(mut self, ms: u64) -> Self {
        self.default_lease_ms = Some(ms);
        self
    }

    /// Set the lease monitor tick in milliseconds
    pub fn monitor_tick_ms(mut self, ms: u64) -> Self {
        self.monitor_tick_ms = Some(ms);
        self
    }

    /// Set the per-subscriber event buffer
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        let defaults = CoordinatorConfig::default();
        let config = CoordinatorConfig {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            enable_cors: self.enable_cors.unwrap_or(defaults.enable_cors),
            enable_request_logging: self
                .enable_request_logging
                .unwrap_or(defaults.enable_request_logging),
            min_lease_ms: self.min_lease_ms.unwrap_or(defaults.min_lease_ms),
            max_lease_ms: self.max_lease_ms.unwrap_or(defaults.max_lease_ms),
            default_lease_ms: self.default_lease_ms.unwrap_or(defaults.default_lease_ms),
            monitor_tick_ms: self.monitor_tick_ms.unwrap_or(defaults.monitor_tick_ms),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.monitor_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder() {
        let config = CoordinatorConfig::builder()
            .lease_bounds_ms(1_000, 60_000)
            .default_lease_ms(10_000)
            .monitor_tick_ms(500)
            .enable_cors(false)
            .build()
            .unwrap();

        assert_eq!(config.min_lease_ms, 1_000);
        assert_eq!(config.default_lease_ms, 10_000);
        assert!(!config.enable_cors);
    }

    #[test]
    fn test_lease_clamping() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.clamp_lease(Some(5_000)), Duration::from_millis(5_000));
        assert_eq!(config.clamp_lease(Some(10)), Duration::from_millis(2_000));
        assert_eq!(config.clamp_lease(Some(u64::MAX)), Duration::from_millis(120_000));
        assert_eq!(config.clamp_lease(None), Duration::from_millis(30_000));
    }

    #[test]
    fn test_config_validation_fails() {
        let inverted = CoordinatorConfig::builder().lease_bounds_ms(10_000, 5_000).build();
        assert!(inverted.is_err());

        let slow_tick = CoordinatorConfig::builder().monitor_tick_ms(5_000).build();
        assert!(matches!(
            slow_tick,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "monitor_tick_ms"
        ));

        let no_buffer = CoordinatorConfig::builder().event_capacity(0).build();
        assert!(no_buffer.is_err());
    }

    #[test]
    fn test_config_builder_with_address() {
        let config = CoordinatorConfig::builder()
            .bind_address_str("127.0.0.1:9000")
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.bind_address.port(), 9000);
        assert!(CoordinatorConfig::builder().bind_address_str("nope").is_err());
    }
}
