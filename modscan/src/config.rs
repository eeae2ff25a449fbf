//! Configuration for the scanner binary.

use std::path::Path;
use std::time::Duration;

use modscan_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{Endpoint, MAX_READ_REGISTERS};
use crate::scan::{DEFAULT_STRIDE, ScanPolicy};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] modscan_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Device to poll
    pub device: DeviceConfig,

    /// Address range and loop settings
    pub scan: ScanConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for one Modbus TCP device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_request_timeout_ms() -> u64 {
    8_000
}

/// Address range and polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First address (0-based)
    #[serde(default)]
    pub start: u16,

    /// Last address, inclusive
    pub end: u16,

    /// Registers read per address (default: 2, one f32)
    #[serde(default = "default_quantity")]
    pub quantity: u16,

    /// Address step between reads
    #[serde(default = "default_stride")]
    pub stride: u16,

    /// Seconds between scans
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Number of scans to run; runs until interrupted when absent
    #[serde(default)]
    pub iterations: Option<u32>,

    /// Retry count on timeout or transport failure
    #[serde(default)]
    pub retries: u32,

    /// Error handling policy
    #[serde(default)]
    pub policy: ScanPolicy,
}

fn default_quantity() -> u16 {
    2
}

fn default_stride() -> u16 {
    DEFAULT_STRIDE
}

fn default_interval_secs() -> u64 {
    1
}

impl ScannerConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ScannerConfig = modscan_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ScannerConfig = modscan_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.is_empty() {
            return Err(ConfigError::Validation(
                "Device host cannot be empty".to_string(),
            ));
        }

        if self.device.unit_id == 0 || self.device.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "unit_id must be 1-247, got {}",
                self.device.unit_id
            )));
        }

        if self.scan.start > self.scan.end {
            return Err(ConfigError::Validation(format!(
                "scan start ({}) must not exceed end ({})",
                self.scan.start, self.scan.end
            )));
        }

        if self.scan.quantity == 0 || self.scan.quantity > MAX_READ_REGISTERS {
            return Err(ConfigError::Validation(format!(
                "quantity must be 1-{}, got {}",
                MAX_READ_REGISTERS, self.scan.quantity
            )));
        }

        if self.scan.stride == 0 {
            return Err(ConfigError::Validation(
                "stride must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl DeviceConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
