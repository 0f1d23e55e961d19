//! Spectrometer capability traits.
//!
//! The vendor SDK (or the simulator in [`sim`]) is reached only through
//! [`DeviceProvider`] and [`DeviceHandle`]. A provider is created by the caller
//! and passed into each session explicitly; nothing here keeps global SDK
//! state.

pub mod sim;

use std::fmt;
use std::ops::{Deref, DerefMut};

use log::{debug, warn};
use serde::Serialize;

use crate::error::DeviceError;
use crate::spectral::model::RawSpectrum;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Entry point into a device backend.
pub trait DeviceProvider: Send + Sync {
    type Handle: DeviceHandle;

    /// Probe the bus and open a handle for every attached spectrometer.
    ///
    /// Every returned handle must eventually be released, whether or not the
    /// caller ends up using it.
    fn enumerate(&self) -> Result<Vec<Self::Handle>, DeviceError>;
}

/// An opened spectrometer.
pub trait DeviceHandle: Send {
    fn serial_number(&mut self) -> Result<String, DeviceError>;

    /// Integration time of each exposure, in microseconds.
    fn set_exposure_duration(&mut self, micros: u32) -> Result<(), DeviceError>;

    /// Block until one exposure is available and return it.
    fn capture_raw_exposure(&mut self) -> Result<RawSpectrum, DeviceError>;

    /// Number of pixels in a formatted spectrum.
    fn formatted_spectrum_length(&mut self) -> Result<usize, DeviceError>;

    fn wavelength_coefficients(&mut self) -> Result<Vec<f64>, DeviceError>;

    fn nonlinearity_coefficients(&mut self) -> Result<Vec<f64>, DeviceError>;

    /// Close the device. Called exactly once, by [`DeviceLease`].
    fn release(&mut self) -> Result<(), DeviceError>;

    fn revision(&mut self) -> Result<Revision, DeviceError> {
        Err(DeviceError::Unsupported("revision"))
    }

    /// Whether the unit carries an on-board spectrum buffer (FX class).
    fn supports_data_buffer(&mut self) -> bool {
        false
    }

    /// Put the device in software-trigger, buffered acquisition mode.
    fn configure_data_buffer(&mut self, _config: &DataBufferConfig) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("data buffer"))
    }

    /// Drain up to `max` buffered spectra. Non-blocking: returns an empty
    /// vector when the buffer is empty.
    fn read_buffered(&mut self, _max: usize) -> Result<Vec<BufferedSpectrum>, DeviceError> {
        Err(DeviceError::Unsupported("data buffer"))
    }

    fn clear_data_buffer(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("data buffer"))
    }
}

// ---------------------------------------------------------------------------
// Device descriptions
// ---------------------------------------------------------------------------

/// Hardware, firmware and FPGA revision strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub hardware: String,
    pub firmware: String,
    pub fpga: String,
}

/// What `list` reports for each attached unit.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub pixels: Option<usize>,
    pub revision: Option<Revision>,
    pub data_buffer: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)?;
        if let Some(pixels) = self.pixels {
            write!(f, "  pixels={pixels}")?;
        }
        if let Some(rev) = &self.revision {
            write!(f, "  hw={} fw={} fpga={}", rev.hardware, rev.firmware, rev.fpga)?;
        }
        if self.data_buffer {
            write!(f, "  [data buffer]")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffered acquisition types
// ---------------------------------------------------------------------------

/// Data buffer settings for FX-class devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, Serialize)]
#[serde(default)]
pub struct DataBufferConfig {
    /// Spectra the on-board buffer can hold.
    pub capacity: usize,
    /// Scans acquired back to back for every software trigger.
    pub scans_per_trigger: usize,
    /// Most spectra returned by one buffer read.
    pub max_per_read: usize,
}

impl Default for DataBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 5000,
            scans_per_trigger: 10,
            max_per_read: 15,
        }
    }
}

/// A raw spectrum drained from the device buffer with its device timestamp.
#[derive(Debug, Clone)]
pub struct BufferedSpectrum {
    /// Device clock at acquisition, microseconds.
    pub timestamp_us: u64,
    pub spectrum: RawSpectrum,
}

// ---------------------------------------------------------------------------
// DeviceLease – exclusive ownership with guaranteed release
// ---------------------------------------------------------------------------

/// Owns a handle and releases it exactly once: explicitly via
/// [`DeviceLease::release`], or on drop for every other exit path (errors,
/// cancellation, panics).
pub struct DeviceLease<H: DeviceHandle> {
    handle: Option<H>,
    label: String,
}

impl<H: DeviceHandle> DeviceLease<H> {
    pub fn new(handle: H) -> Self {
        DeviceLease {
            handle: Some(handle),
            label: String::from("<unidentified>"),
        }
    }

    /// Name used in release log lines, normally the serial number.
    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    /// Release the device now and report the outcome.
    pub fn release(mut self) -> Result<(), DeviceError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), DeviceError> {
        match self.handle.take() {
            Some(mut handle) => {
                debug!("Releasing device {}", self.label);
                handle.release()
            }
            None => Ok(()),
        }
    }
}

impl<H: DeviceHandle> Deref for DeviceLease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        // `handle` is only taken by `release_inner`, which consumes or drops the lease.
        match &self.handle {
            Some(h) => h,
            None => unreachable!("device lease used after release"),
        }
    }
}

impl<H: DeviceHandle> DerefMut for DeviceLease<H> {
    fn deref_mut(&mut self) -> &mut H {
        match &mut self.handle {
            Some(h) => h,
            None => unreachable!("device lease used after release"),
        }
    }
}

impl<H: DeviceHandle> Drop for DeviceLease<H> {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!("Releasing device {} failed: {err}", self.label);
        }
    }
}

impl<H: DeviceHandle> fmt::Debug for DeviceLease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("label", &self.label)
            .field("held", &self.handle.is_some())
            .finish()
    }
}
