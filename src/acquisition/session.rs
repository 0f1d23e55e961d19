use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, trace, warn};

use super::buffered;
use crate::config::{BufferedSettings, Config, RetryPolicy};
use crate::device::{DeviceHandle, DeviceLease, DeviceProvider};
use crate::error::{AcquisitionError, DeviceError};
use crate::spectral::correction::{correct_nonlinearity, wavelength_table};
use crate::spectral::model::{
    CorrectedSpectrum, NonlinearityCoefficients, RawSpectrum, SessionOutput,
    WavelengthCoefficients, WavelengthTable,
};

// ---------------------------------------------------------------------------
// Plan & control
// ---------------------------------------------------------------------------

/// How exposures are pulled off the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// One blocking request per exposure.
    #[default]
    Single,
    /// Software-triggered bursts drained from the on-board buffer.
    Buffered,
}

/// Everything a session needs to know besides the device it binds to.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    pub exposure_time_us: u32,
    pub exposures: usize,
    pub inter_exposure_delay: Duration,
    pub retry: RetryPolicy,
    pub mode: CaptureMode,
    pub buffered: BufferedSettings,
}

impl AcquisitionPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exposure_time_us: config.acquisition.exposure_time_us,
            exposures: config.acquisition.exposures,
            inter_exposure_delay: config.acquisition.inter_exposure_delay(),
            retry: config.retry,
            mode: CaptureMode::Single,
            buffered: config.buffered,
        }
    }
}

impl Default for AcquisitionPlan {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Cooperative stop flag, checked between exposures and between
/// enumeration attempts. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Searching,
    Bound,
    Capturing,
    Closed,
    Failed,
}

/// Calibration read from the bound device, fixed for the whole session.
#[derive(Debug, Clone)]
pub(crate) struct Calibration {
    pub nonlinearity: NonlinearityCoefficients,
    pub wavelengths: WavelengthTable,
}

impl Calibration {
    /// Correct one raw exposure, enforcing the session's pixel count.
    pub fn apply(
        &self,
        serial: &str,
        exposure: usize,
        raw: &RawSpectrum,
    ) -> Result<CorrectedSpectrum, AcquisitionError> {
        if raw.len() != self.wavelengths.len() {
            return Err(AcquisitionError::Capture {
                serial: serial.to_string(),
                exposure,
                source: DeviceError::LengthMismatch {
                    expected: self.wavelengths.len(),
                    found: raw.len(),
                },
            });
        }
        Ok(correct_nonlinearity(raw, &self.nonlinearity))
    }
}

// ---------------------------------------------------------------------------
// AcquisitionSession
// ---------------------------------------------------------------------------

/// Binds to the spectrometer with a given serial number and captures a
/// bounded series of corrected exposures from it.
///
/// `Searching → Bound → Capturing → Closed`, or `Failed` from any of them.
/// The device is held by a [`DeviceLease`], so it is released exactly once on
/// every exit path.
pub struct AcquisitionSession<'p, P: DeviceProvider> {
    provider: &'p P,
    serial: String,
    plan: AcquisitionPlan,
    state: SessionState,
}

impl<'p, P: DeviceProvider> AcquisitionSession<'p, P> {
    pub fn new(provider: &'p P, serial: &str, plan: AcquisitionPlan) -> Self {
        AcquisitionSession {
            provider,
            serial: serial.to_string(),
            plan,
            state: SessionState::Searching,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion. On error the session ends in
    /// [`SessionState::Failed`] with the device already released.
    pub fn run(&mut self, stop: &StopSignal) -> Result<SessionOutput, AcquisitionError> {
        let result = self.run_inner(stop);
        match &result {
            Ok(output) => info!(
                "Device {}: captured {} spectra",
                self.serial,
                output.len()
            ),
            Err(err) => {
                self.state = SessionState::Failed;
                warn!("Device {}: session failed ({}): {err}", self.serial, err.kind());
            }
        }
        result
    }

    fn run_inner(&mut self, stop: &StopSignal) -> Result<SessionOutput, AcquisitionError> {
        self.state = SessionState::Searching;
        let mut lease = self.search(stop)?;

        self.state = SessionState::Bound;
        let calibration = self.bind(&mut lease)?;

        self.state = SessionState::Capturing;
        let spectra = match self.plan.mode {
            CaptureMode::Single => self.capture(&mut lease, &calibration, stop)?,
            CaptureMode::Buffered => buffered::capture(
                &mut lease,
                &self.serial,
                &calibration,
                self.plan.exposures,
                &self.plan.buffered,
                stop,
            )?,
        };

        if let Err(err) = lease.release() {
            warn!("Device {}: release reported {err}", self.serial);
        }
        self.state = SessionState::Closed;

        Ok(SessionOutput {
            serial: self.serial.clone(),
            exposure_time_us: self.plan.exposure_time_us,
            wavelengths: calibration.wavelengths,
            spectra,
        })
    }

    /// Probe the bus until the target shows up, re-enumerating at most
    /// `retry.max_retries` times with `retry.backoff` in between.
    fn search(&self, stop: &StopSignal) -> Result<DeviceLease<P::Handle>, AcquisitionError> {
        let attempts = self.plan.retry.max_attempts();
        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(
                    "Device {} not found, re-probing in {:?} ({}/{})",
                    self.serial,
                    self.plan.retry.backoff(),
                    attempt - 1,
                    self.plan.retry.max_retries
                );
                sleep(self.plan.retry.backoff());
            }
            if stop.is_stopped() {
                return Err(AcquisitionError::Cancelled {
                    serial: self.serial.clone(),
                    captured: 0,
                });
            }
            match self.provider.enumerate() {
                Ok(handles) => {
                    if let Some(lease) = self.pick(handles) {
                        info!("Bound device {} on attempt {attempt}", self.serial);
                        return Ok(lease);
                    }
                }
                Err(err) => warn!("Device enumeration failed: {err}"),
            }
        }
        Err(AcquisitionError::DeviceNotFound {
            serial: self.serial.clone(),
            attempts,
        })
    }

    /// Keep the handle whose serial matches; every other handle is released
    /// as its lease drops.
    fn pick(&self, handles: Vec<P::Handle>) -> Option<DeviceLease<P::Handle>> {
        let mut found = None;
        for handle in handles {
            let mut lease = DeviceLease::new(handle);
            if found.is_some() {
                continue;
            }
            match lease.serial_number() {
                Ok(serial) if serial == self.serial => {
                    lease.set_label(&serial);
                    found = Some(lease);
                }
                Ok(serial) => {
                    trace!("Skipping device {serial}");
                    lease.set_label(&serial);
                }
                Err(err) => warn!("Could not read serial number: {err}"),
            }
        }
        found
    }

    /// Verify identity, read the calibration, and configure the exposure.
    fn bind(&self, lease: &mut DeviceLease<P::Handle>) -> Result<Calibration, AcquisitionError> {
        let serial = self.serial.as_str();
        let config_err = |e: DeviceError| AcquisitionError::configuration(serial, e);

        let reported = lease.serial_number().map_err(config_err)?;
        if reported != serial {
            return Err(AcquisitionError::SerialNumberMismatch {
                expected: serial.to_string(),
                found: reported,
            });
        }

        let wl_coeffs = lease.wavelength_coefficients().map_err(config_err)?;
        let wl_coeffs = WavelengthCoefficients::from_slice(&wl_coeffs)
            .map_err(|e| AcquisitionError::configuration(serial, e))?;
        let nl_coeffs = lease.nonlinearity_coefficients().map_err(config_err)?;
        let nonlinearity = NonlinearityCoefficients::new(nl_coeffs)
            .map_err(|e| AcquisitionError::configuration(serial, e))?;
        let pixels = lease.formatted_spectrum_length().map_err(config_err)?;
        let wavelengths = wavelength_table(&wl_coeffs, pixels);
        debug!(
            "Device {serial}: {pixels} pixels, {:.1}..{:.1} nm, {} nonlinearity terms",
            wavelengths.first().copied().unwrap_or(f64::NAN),
            wavelengths.last().copied().unwrap_or(f64::NAN),
            nonlinearity.as_slice().len()
        );

        lease
            .set_exposure_duration(self.plan.exposure_time_us)
            .map_err(config_err)?;

        Ok(Calibration {
            nonlinearity,
            wavelengths,
        })
    }

    fn capture(
        &self,
        lease: &mut DeviceLease<P::Handle>,
        calibration: &Calibration,
        stop: &StopSignal,
    ) -> Result<Vec<CorrectedSpectrum>, AcquisitionError> {
        info!(
            "Device {}: reading {} spectra at {} us",
            self.serial, self.plan.exposures, self.plan.exposure_time_us
        );
        let mut spectra = Vec::with_capacity(self.plan.exposures);
        for exposure in 0..self.plan.exposures {
            if exposure > 0 && !self.plan.inter_exposure_delay.is_zero() {
                sleep(self.plan.inter_exposure_delay);
            }
            if stop.is_stopped() {
                return Err(AcquisitionError::Cancelled {
                    serial: self.serial.clone(),
                    captured: exposure,
                });
            }
            let raw = lease
                .capture_raw_exposure()
                .map_err(|source| AcquisitionError::Capture {
                    serial: self.serial.clone(),
                    exposure,
                    source,
                })?;
            spectra.push(calibration.apply(&self.serial, exposure, &raw)?);
        }
        Ok(spectra)
    }
}

/// Convenience wrapper: build a session, run it, hand back its output.
pub fn acquire<P: DeviceProvider>(
    provider: &P,
    serial: &str,
    plan: &AcquisitionPlan,
    stop: &StopSignal,
) -> Result<SessionOutput, AcquisitionError> {
    AcquisitionSession::new(provider, serial, plan.clone()).run(stop)
}
