//! Spectrometer and serial telemetry acquisition.
//!
//! - [`spectral`]: spectrum types, nonlinearity and wavelength corrections,
//!   CSV/Parquet export.
//! - [`device`]: the capability traits a spectrometer backend implements,
//!   plus a simulated backend.
//! - [`acquisition`]: device search with bounded retry, capture sessions and
//!   one-thread-per-device runs.
//! - [`telemetry`]: serial line logger for the heater controller board.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod spectral;
pub mod telemetry;

pub use config::Config;
pub use error::{AcquisitionError, DeviceError, ErrorKind};
