// Bus, address and timing defaults; optional JSON overrides
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::{DrainWait, FirmwareRevision};

// Factory I2C address of the MD20
pub const DEFAULT_ADDRESS: u8 = 0x16;

// i2c-dev node used by the CLI
pub const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";

// Give up on a command the peripheral has not drained after this long
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// Telemetry monitor loop frequency
pub const MONITOR_HZ: u64 = 5;

/// Error loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Driver settings, all optional in the JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub bus: String,
    pub address: u8,
    pub firmware: FirmwareRevision,
    /// `null` waits forever for a command to drain
    pub drain_timeout_ms: Option<u64>,
    pub poll_interval_us: u64,
    /// Stop every channel when the device handle is dropped
    pub stop_on_drop: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bus: DEFAULT_I2C_BUS.to_string(),
            address: DEFAULT_ADDRESS,
            firmware: FirmwareRevision::default(),
            drain_timeout_ms: Some(DEFAULT_DRAIN_TIMEOUT.as_millis() as u64),
            poll_interval_us: 0,
            stop_on_drop: true,
        }
    }
}

impl DriverConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn drain_wait(&self) -> DrainWait {
        DrainWait {
            timeout: self.drain_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_micros(self.poll_interval_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "address": 23, "firmware": "v1" }"#).unwrap();
        assert_eq!(config.address, 23);
        assert_eq!(config.firmware, FirmwareRevision::V1);
        assert_eq!(config.bus, DEFAULT_I2C_BUS);
        assert_eq!(config.drain_wait().timeout, Some(DEFAULT_DRAIN_TIMEOUT));
        assert!(config.stop_on_drop);
    }

    #[test]
    fn test_null_timeout_is_unbounded() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "drain_timeout_ms": null, "poll_interval_us": 250 }"#)
                .unwrap();
        let wait = config.drain_wait();
        assert_eq!(wait.timeout, None);
        assert_eq!(wait.poll_interval, Duration::from_micros(250));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = DriverConfig::from_json_file("/nonexistent/md20.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
