//! Error types for the acquisition library.
//!
//! Each layer gets its own `thiserror` enum so callers can match on what
//! actually went wrong:
//!
//! - **`DeviceError`**: failures reported by the spectrometer backend (the
//!   vendor SDK or the simulator).
//! - **`CoefficientError`**: an incomplete or malformed calibration profile.
//! - **`AcquisitionError`**: the terminal outcome of a failed session. Every
//!   variant names the device it concerns so concurrent failures stay
//!   attributable.
//! - **`ExportError`**, **`ConfigError`**, **`TelemetryError`**: file output,
//!   configuration loading and the serial telemetry monitor.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Device backend
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error code and message as reported by the vendor SDK.
    #[error("SDK error {code}: {message}")]
    Sdk { code: i32, message: String },

    #[error("operation not supported by this device: {0}")]
    Unsupported(&'static str),

    #[error("device handle used after release")]
    Released,

    #[error("spectrum has {found} pixels, device reports {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("data buffer still empty after {0} polls")]
    BufferEmpty(u32),
}

// ---------------------------------------------------------------------------
// Calibration coefficients
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoefficientError {
    #[error("wavelength calibration needs 4 coefficients, device reported {found}")]
    TooFewWavelengthTerms { found: usize },

    #[error("{set} coefficient {index} is not a finite number")]
    NotFinite { set: &'static str, index: usize },
}

// ---------------------------------------------------------------------------
// Acquisition sessions
// ---------------------------------------------------------------------------

/// Failure category of a session, independent of the device it happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceNotFound,
    Configuration,
    Capture,
    SerialNumberMismatch,
    Cancelled,
    Enumeration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Capture => "capture error",
            ErrorKind::SerialNumberMismatch => "serial number mismatch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Enumeration => "enumeration error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("device {serial} not found after {attempts} enumeration attempts")]
    DeviceNotFound { serial: String, attempts: u32 },

    #[error("device {serial}: configuration error: {reason}")]
    Configuration { serial: String, reason: String },

    #[error("device {serial}: exposure {exposure} failed: {source}")]
    Capture {
        serial: String,
        exposure: usize,
        #[source]
        source: DeviceError,
    },

    #[error("bound device reports serial {found}, expected {expected}")]
    SerialNumberMismatch { expected: String, found: String },

    #[error("device {serial}: stopped after {captured} exposures")]
    Cancelled { serial: String, captured: usize },

    #[error("device enumeration failed: {0}")]
    Enumeration(#[source] DeviceError),
}

impl AcquisitionError {
    /// Serial number of the device the failure concerns, if any.
    pub fn serial(&self) -> Option<&str> {
        match self {
            AcquisitionError::DeviceNotFound { serial, .. }
            | AcquisitionError::Configuration { serial, .. }
            | AcquisitionError::Capture { serial, .. }
            | AcquisitionError::Cancelled { serial, .. } => Some(serial),
            AcquisitionError::SerialNumberMismatch { expected, .. } => Some(expected),
            AcquisitionError::Enumeration(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquisitionError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            AcquisitionError::Configuration { .. } => ErrorKind::Configuration,
            AcquisitionError::Capture { .. } => ErrorKind::Capture,
            AcquisitionError::SerialNumberMismatch { .. } => ErrorKind::SerialNumberMismatch,
            AcquisitionError::Cancelled { .. } => ErrorKind::Cancelled,
            AcquisitionError::Enumeration(_) => ErrorKind::Enumeration,
        }
    }

    pub(crate) fn configuration(serial: &str, reason: impl fmt::Display) -> Self {
        AcquisitionError::Configuration {
            serial: serial.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output files
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("spectrum {index} has {found} values, wavelength axis has {expected}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("malformed spectra file: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration validation error: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Serial telemetry
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("opening serial port {port} at {baud_rate} baud: {source}")]
    Open {
        port: String,
        baud_rate: u32,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
