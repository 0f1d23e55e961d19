//! Buffered acquisition for FX-class units.
//!
//! In software-trigger mode every buffer read doubles as a trigger: the device
//! captures `scans_per_trigger` spectra back to back into its on-board buffer
//! and later reads drain them. Reads never block, so an empty read is normal
//! right after a trigger and is answered by polling again.

use std::thread::sleep;

use log::{debug, trace, warn};

use super::session::{Calibration, StopSignal};
use crate::config::BufferedSettings;
use crate::device::{DeviceHandle, DeviceLease};
use crate::error::{AcquisitionError, DeviceError};
use crate::spectral::model::CorrectedSpectrum;

pub(crate) fn capture<H: DeviceHandle>(
    lease: &mut DeviceLease<H>,
    serial: &str,
    calibration: &Calibration,
    exposures: usize,
    settings: &BufferedSettings,
    stop: &StopSignal,
) -> Result<Vec<CorrectedSpectrum>, AcquisitionError> {
    if !lease.supports_data_buffer() {
        return Err(AcquisitionError::configuration(
            serial,
            "buffered capture requested but the device has no data buffer",
        ));
    }
    lease
        .configure_data_buffer(&settings.buffer)
        .map_err(|e| AcquisitionError::configuration(serial, e))?;
    debug!(
        "Device {serial}: data buffer enabled (capacity {}, {} scans per trigger)",
        settings.buffer.capacity, settings.buffer.scans_per_trigger
    );

    let mut spectra = Vec::with_capacity(exposures);
    let mut empty_polls = 0u32;

    while spectra.len() < exposures {
        if stop.is_stopped() {
            return Err(AcquisitionError::Cancelled {
                serial: serial.to_string(),
                captured: spectra.len(),
            });
        }

        let want = (exposures - spectra.len()).min(settings.buffer.max_per_read);
        let batch = lease
            .read_buffered(want)
            .map_err(|source| AcquisitionError::Capture {
                serial: serial.to_string(),
                exposure: spectra.len(),
                source,
            })?;

        if batch.is_empty() {
            empty_polls += 1;
            if empty_polls > settings.max_empty_polls {
                return Err(AcquisitionError::Capture {
                    serial: serial.to_string(),
                    exposure: spectra.len(),
                    source: DeviceError::BufferEmpty(empty_polls),
                });
            }
            trace!("Device {serial}: buffer empty, polling again");
            sleep(settings.poll_interval());
            continue;
        }
        empty_polls = 0;

        // Devices may hand back more than asked for; keep only what was requested.
        for item in batch.into_iter().take(want) {
            trace!("Device {serial}: buffered spectrum at {} us", item.timestamp_us);
            let corrected = calibration.apply(serial, spectra.len(), &item.spectrum)?;
            spectra.push(corrected);
        }
    }

    if let Err(err) = lease.clear_data_buffer() {
        warn!("Device {serial}: clearing data buffer failed: {err}");
    }
    Ok(spectra)
}

#[cfg(test)]
mod tests {
    use crate::acquisition::session::{acquire, AcquisitionPlan, CaptureMode, StopSignal};
    use crate::config::{BufferedSettings, RetryPolicy};
    use crate::device::sim::{SimDeviceConfig, SimProvider};
    use crate::device::DataBufferConfig;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn buffered_plan(exposures: usize, scans_per_trigger: usize) -> AcquisitionPlan {
        AcquisitionPlan {
            exposures,
            inter_exposure_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_retries: 0,
                backoff_ms: 0,
            },
            mode: CaptureMode::Buffered,
            buffered: BufferedSettings {
                buffer: DataBufferConfig {
                    scans_per_trigger,
                    ..DataBufferConfig::default()
                },
                poll_interval_ms: 0,
                max_empty_polls: 3,
            },
            ..AcquisitionPlan::default()
        }
    }

    fn fx(serial: &str) -> SimDeviceConfig {
        SimDeviceConfig {
            pixels: 32,
            data_buffer: true,
            ..SimDeviceConfig::with_serial(serial)
        }
    }

    #[test]
    fn drains_requested_count_across_triggers() {
        let provider = SimProvider::new(vec![fx("FX")]);
        let output = acquire(&provider, "FX", &buffered_plan(25, 10), &StopSignal::new()).unwrap();
        assert_eq!(output.len(), 25);
        assert!(output.spectra.iter().all(|s| s.len() == 32));
        let counters = provider.counters("FX").unwrap();
        assert_eq!(counters.captures(), 25);
        assert_eq!(counters.released(), 1);
    }

    #[test]
    fn device_without_buffer_is_rejected() {
        let provider = SimProvider::new(vec![SimDeviceConfig {
            pixels: 32,
            ..SimDeviceConfig::with_serial("HR")
        }]);
        let err = acquire(&provider, "HR", &buffered_plan(5, 10), &StopSignal::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(provider.counters("HR").unwrap().released(), 1);
    }

    #[test]
    fn buffer_that_never_fills_times_out() {
        // A zero-capacity buffer never holds a spectrum.
        let provider = SimProvider::new(vec![fx("FX")]);
        let mut plan = buffered_plan(5, 10);
        plan.buffered.buffer.capacity = 0;
        let err = acquire(&provider, "FX", &plan, &StopSignal::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capture);
        assert_eq!(provider.counters("FX").unwrap().released(), 1);
    }
}
