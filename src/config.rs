//! Run-time settings.
//!
//! Every timing constant of the acquisition loop lives here with its default,
//! and can be overridden from a TOML file:
//!
//! ```toml
//! [acquisition]
//! exposure_time_us = 50000
//! exposures = 20
//! inter_exposure_delay_ms = 100
//!
//! [retry]
//! max_retries = 3
//! backoff_ms = 1000
//!
//! [buffered]
//! capacity = 5000
//! scans_per_trigger = 10
//!
//! [telemetry]
//! port = "/dev/ttyACM0"
//! baud_rate = 9600
//!
//! [[simulator.devices]]
//! serial = "HR4P0001"
//! pixels = 3648
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::sim::SimDeviceConfig;
use crate::device::DataBufferConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub acquisition: AcquisitionSettings,
    pub retry: RetryPolicy,
    pub buffered: BufferedSettings,
    pub telemetry: TelemetrySettings,
    pub simulator: SimulatorSettings,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acquisition.exposure_time_us == 0 {
            return Err(ConfigError::Invalid("exposure_time_us must be positive".into()));
        }
        if self.buffered.buffer.max_per_read == 0 || self.buffered.buffer.scans_per_trigger == 0 {
            return Err(ConfigError::Invalid(
                "buffered max_per_read and scans_per_trigger must be positive".into(),
            ));
        }
        if self.telemetry.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Integration time of each exposure, microseconds.
    pub exposure_time_us: u32,
    /// Exposures per session.
    pub exposures: usize,
    /// Pause between consecutive captures so the device pipeline keeps up.
    pub inter_exposure_delay_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            exposure_time_us: 100_000,
            exposures: 20,
            inter_exposure_delay_ms: 100,
        }
    }
}

impl AcquisitionSettings {
    pub fn inter_exposure_delay(&self) -> Duration {
        Duration::from_millis(self.inter_exposure_delay_ms)
    }
}

/// Bounded re-enumeration while looking for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-enumerations after the first probe finds no match.
    pub max_retries: u32,
    /// Wait before each re-enumeration.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Total enumerations a search may perform.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferedSettings {
    #[serde(flatten)]
    pub buffer: DataBufferConfig,
    /// Wait after a read that returned no spectra.
    pub poll_interval_ms: u64,
    /// Consecutive empty reads tolerated before the capture fails.
    pub max_empty_polls: u32,
}

impl Default for BufferedSettings {
    fn default() -> Self {
        Self {
            buffer: DataBufferConfig::default(),
            poll_interval_ms: 10,
            max_empty_polls: 500,
        }
    }
}

impl BufferedSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Serial telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub port: Option<String>,
    pub baud_rate: u32,
    /// The board resets when the port opens; give it time to boot.
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            settle_delay_ms: 2000,
            read_timeout_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub devices: Vec<SimDeviceConfig>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            devices: SimDeviceConfig::lab_defaults(),
        }
    }
}
