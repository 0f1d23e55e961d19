//! Deterministic simulated spectrometers.
//!
//! Stands in for the vendor SDK when no hardware is attached, and doubles as
//! the test collaborator: every simulated unit counts opens, releases and any
//! use after release, and can be told to fail at specific points.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};

use super::{BufferedSpectrum, DataBufferConfig, DeviceHandle, DeviceProvider, Revision};
use crate::error::DeviceError;
use crate::spectral::model::RawSpectrum;

const FULL_SCALE: f64 = 65535.0;

// ---------------------------------------------------------------------------
// Configuration of one simulated unit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimDeviceConfig {
    pub serial: String,
    pub pixels: usize,
    pub wavelength_coefficients: Vec<f64>,
    pub nonlinearity_coefficients: Vec<f64>,
    /// Baseline counts present in every pixel.
    pub dark_level: f64,
    /// Peak height in counts at a 100 ms exposure; scales with exposure time.
    pub peak_counts: f64,
    /// Peak centre as a fraction of the detector width.
    pub peak_position: f64,
    /// Peak standard deviation in pixels.
    pub peak_width: f64,
    /// Standard deviation of the additive read noise.
    pub noise: f64,
    /// FX-class on-board spectrum buffer.
    pub data_buffer: bool,
    /// Block for the exposure time on every capture.
    pub realtime: bool,
    /// Enumerations the unit stays invisible for, as after a USB reset.
    pub hidden_enumerations: usize,
    /// Zero-based exposure index at which capture starts failing.
    pub fail_capture_at: Option<usize>,
    /// Refuse any exposure duration.
    pub reject_exposure_time: bool,
    /// Serial reported on every query after the first one.
    pub serial_after_open: Option<String>,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            serial: "SIM00001".to_string(),
            pixels: 3648,
            wavelength_coefficients: vec![186.5, 0.2818, -1.53e-5, -1.7e-10],
            nonlinearity_coefficients: vec![-1.2e-6, 3.5e-11],
            dark_level: 1500.0,
            peak_counts: 30000.0,
            peak_position: 0.5,
            peak_width: 40.0,
            noise: 12.0,
            data_buffer: false,
            realtime: false,
            hidden_enumerations: 0,
            fail_capture_at: None,
            reject_exposure_time: false,
            serial_after_open: None,
        }
    }
}

impl SimDeviceConfig {
    pub fn with_serial(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            ..Self::default()
        }
    }

    /// An HR4Pro-like and an FX-like unit.
    pub fn lab_defaults() -> Vec<Self> {
        vec![
            SimDeviceConfig::with_serial("HR4P0001"),
            SimDeviceConfig {
                serial: "FX000002".to_string(),
                pixels: 2068,
                wavelength_coefficients: vec![197.8, 0.4589, -2.04e-5, -2.9e-10],
                peak_position: 0.3,
                data_buffer: true,
                ..SimDeviceConfig::default()
            },
        ]
    }
}

// ---------------------------------------------------------------------------
// Per-unit counters
// ---------------------------------------------------------------------------

/// Lifetime counters for one simulated unit, shared by all its handles.
#[derive(Debug, Default)]
pub struct SimCounters {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub captures: AtomicUsize,
    pub used_after_release: AtomicUsize,
}

impl SimCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn used_after_release(&self) -> usize {
        self.used_after_release.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SimProvider
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimProvider {
    devices: Vec<Arc<SimDeviceConfig>>,
    counters: HashMap<String, Arc<SimCounters>>,
    enumerations: AtomicUsize,
}

impl SimProvider {
    pub fn new(devices: Vec<SimDeviceConfig>) -> Self {
        let counters = devices
            .iter()
            .map(|d| (d.serial.clone(), Arc::new(SimCounters::default())))
            .collect();
        SimProvider {
            devices: devices.into_iter().map(Arc::new).collect(),
            counters,
            enumerations: AtomicUsize::new(0),
        }
    }

    /// Counters of the unit with `serial`, if it is configured.
    pub fn counters(&self, serial: &str) -> Option<Arc<SimCounters>> {
        self.counters.get(serial).cloned()
    }

    /// How many times the bus has been probed.
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for SimProvider {
    type Handle = SimHandle;

    fn enumerate(&self) -> Result<Vec<SimHandle>, DeviceError> {
        let probe = self.enumerations.fetch_add(1, Ordering::SeqCst);
        let handles: Vec<SimHandle> = self
            .devices
            .iter()
            .filter(|d| probe >= d.hidden_enumerations)
            .map(|d| {
                let counters = self.counters[&d.serial].clone();
                counters.opened.fetch_add(1, Ordering::SeqCst);
                SimHandle::open(d.clone(), counters)
            })
            .collect();
        trace!("Simulated probe {probe}: {} device(s)", handles.len());
        Ok(handles)
    }
}

// ---------------------------------------------------------------------------
// SimHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimHandle {
    config: Arc<SimDeviceConfig>,
    counters: Arc<SimCounters>,
    released: bool,
    exposure_us: u32,
    captured: usize,
    serial_queries: usize,
    noise_seed: u64,
    frames: u64,
    buffer_config: Option<DataBufferConfig>,
    buffer: VecDeque<BufferedSpectrum>,
    clock_us: u64,
}

impl SimHandle {
    fn open(config: Arc<SimDeviceConfig>, counters: Arc<SimCounters>) -> Self {
        let noise_seed = fnv1a(config.serial.as_bytes());
        SimHandle {
            config,
            counters,
            released: false,
            exposure_us: 100_000,
            captured: 0,
            serial_queries: 0,
            noise_seed,
            frames: 0,
            buffer_config: None,
            buffer: VecDeque::new(),
            clock_us: 0,
        }
    }

    fn check_open(&self) -> Result<(), DeviceError> {
        if self.released {
            self.counters.used_after_release.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    /// Dark level, one emission line scaled by exposure time, read noise.
    fn synthesize(&mut self) -> RawSpectrum {
        let mut noise = ReadNoise::for_frame(self.noise_seed, self.frames);
        self.frames += 1;

        let cfg = &self.config;
        let height = cfg.peak_counts * f64::from(self.exposure_us) / 100_000.0;
        let centre = cfg.peak_position * cfg.pixels as f64;
        let two_var = 2.0 * cfg.peak_width * cfg.peak_width;
        let counts = (0..cfg.pixels)
            .map(|p| {
                let offset = p as f64 - centre;
                let line = height * (-offset * offset / two_var).exp();
                let read = if cfg.noise > 0.0 {
                    cfg.noise * noise.standard_normal()
                } else {
                    0.0
                };
                (cfg.dark_level + line + read).clamp(0.0, FULL_SCALE)
            })
            .collect();
        RawSpectrum::new(counts)
    }

    fn fill_buffer(&mut self, config: DataBufferConfig) {
        let room = config.capacity.saturating_sub(self.buffer.len());
        for _ in 0..config.scans_per_trigger.min(room) {
            self.clock_us += u64::from(self.exposure_us);
            let spectrum = self.synthesize();
            self.buffer.push_back(BufferedSpectrum {
                timestamp_us: self.clock_us,
                spectrum,
            });
        }
    }
}

impl DeviceHandle for SimHandle {
    fn serial_number(&mut self) -> Result<String, DeviceError> {
        self.check_open()?;
        self.serial_queries += 1;
        match (&self.config.serial_after_open, self.serial_queries) {
            (Some(drifted), n) if n > 1 => Ok(drifted.clone()),
            _ => Ok(self.config.serial.clone()),
        }
    }

    fn set_exposure_duration(&mut self, micros: u32) -> Result<(), DeviceError> {
        self.check_open()?;
        if self.config.reject_exposure_time || micros == 0 {
            return Err(DeviceError::Sdk {
                code: 4,
                message: format!("integration time {micros} us out of range"),
            });
        }
        self.exposure_us = micros;
        Ok(())
    }

    fn capture_raw_exposure(&mut self) -> Result<RawSpectrum, DeviceError> {
        self.check_open()?;
        if self.config.fail_capture_at == Some(self.captured) {
            return Err(DeviceError::Sdk {
                code: 10001,
                message: "spectrum transfer timed out".to_string(),
            });
        }
        if self.config.realtime {
            std::thread::sleep(Duration::from_micros(u64::from(self.exposure_us)));
        }
        self.captured += 1;
        self.counters.captures.fetch_add(1, Ordering::SeqCst);
        Ok(self.synthesize())
    }

    fn formatted_spectrum_length(&mut self) -> Result<usize, DeviceError> {
        self.check_open()?;
        Ok(self.config.pixels)
    }

    fn wavelength_coefficients(&mut self) -> Result<Vec<f64>, DeviceError> {
        self.check_open()?;
        Ok(self.config.wavelength_coefficients.clone())
    }

    fn nonlinearity_coefficients(&mut self) -> Result<Vec<f64>, DeviceError> {
        self.check_open()?;
        Ok(self.config.nonlinearity_coefficients.clone())
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.check_open()?;
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn revision(&mut self) -> Result<Revision, DeviceError> {
        self.check_open()?;
        Ok(Revision {
            hardware: "1.0".to_string(),
            firmware: "2.2.9".to_string(),
            fpga: if self.config.data_buffer { "4.1.0" } else { "n/a" }.to_string(),
        })
    }

    fn supports_data_buffer(&mut self) -> bool {
        self.config.data_buffer
    }

    fn configure_data_buffer(&mut self, config: &DataBufferConfig) -> Result<(), DeviceError> {
        self.check_open()?;
        if !self.config.data_buffer {
            return Err(DeviceError::Unsupported("data buffer"));
        }
        self.buffer.clear();
        self.buffer_config = Some(*config);
        Ok(())
    }

    fn read_buffered(&mut self, max: usize) -> Result<Vec<BufferedSpectrum>, DeviceError> {
        self.check_open()?;
        let Some(config) = self.buffer_config else {
            return Err(DeviceError::Unsupported("data buffer not enabled"));
        };
        if self.buffer.is_empty() {
            // A read on an empty buffer is the software trigger; scans land
            // in the buffer for the next read.
            self.fill_buffer(config);
            return Ok(Vec::new());
        }
        let n = max.min(self.buffer.len());
        self.captured += n;
        self.counters.captures.fetch_add(n, Ordering::SeqCst);
        Ok(self.buffer.drain(..n).collect())
    }

    fn clear_data_buffer(&mut self) -> Result<(), DeviceError> {
        self.check_open()?;
        self.buffer.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Noise source
// ---------------------------------------------------------------------------

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// Read noise for one frame. The stream depends only on the unit and the
/// frame number, so frame `n` of a unit looks the same on every run.
#[derive(Debug)]
struct ReadNoise {
    state: u64,
    spare: Option<f64>,
}

impl ReadNoise {
    fn for_frame(unit_seed: u64, frame: u64) -> Self {
        ReadNoise {
            state: unit_seed ^ frame.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA).rotate_left(17),
            spare: None,
        }
    }

    // splitmix64
    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(GOLDEN_GAMMA);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in [-1, 1).
    fn symmetric(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 52) as f64 - 1.0
    }

    /// Marsaglia polar method; every accepted pair yields two samples.
    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        loop {
            let (u, v) = (self.symmetric(), self.symmetric());
            let s = u * u + v * v;
            if s > 0.0 && s < 1.0 {
                let k = (-2.0 * s.ln() / s).sqrt();
                self.spare = Some(v * k);
                return u * k;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_unit_appears_after_enough_probes() {
        let provider = SimProvider::new(vec![SimDeviceConfig {
            hidden_enumerations: 2,
            ..SimDeviceConfig::with_serial("LATE")
        }]);
        assert!(provider.enumerate().unwrap().is_empty());
        assert!(provider.enumerate().unwrap().is_empty());
        let mut handles = provider.enumerate().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].serial_number().unwrap(), "LATE");
        assert_eq!(provider.enumerations(), 3);
    }

    #[test]
    fn handle_refuses_use_after_release() {
        let provider = SimProvider::new(vec![SimDeviceConfig::with_serial("A")]);
        let mut h = provider.enumerate().unwrap().remove(0);
        h.release().unwrap();
        assert!(matches!(h.capture_raw_exposure(), Err(DeviceError::Released)));
        let counters = provider.counters("A").unwrap();
        assert_eq!(counters.released(), 1);
        assert_eq!(counters.used_after_release(), 1);
    }

    #[test]
    fn noiseless_spectrum_is_dark_plus_peak() {
        let provider = SimProvider::new(vec![SimDeviceConfig {
            pixels: 100,
            noise: 0.0,
            dark_level: 1000.0,
            peak_counts: 0.0,
            ..SimDeviceConfig::with_serial("A")
        }]);
        let mut h = provider.enumerate().unwrap().remove(0);
        let raw = h.capture_raw_exposure().unwrap();
        assert_eq!(raw.len(), 100);
        assert!(raw.iter().all(|&v| v == 1000.0));
        h.release().unwrap();
    }

    #[test]
    fn buffer_read_triggers_then_drains() {
        let provider = SimProvider::new(vec![SimDeviceConfig {
            data_buffer: true,
            pixels: 16,
            ..SimDeviceConfig::with_serial("FX")
        }]);
        let mut h = provider.enumerate().unwrap().remove(0);
        h.configure_data_buffer(&DataBufferConfig {
            scans_per_trigger: 4,
            ..DataBufferConfig::default()
        })
        .unwrap();
        assert!(h.read_buffered(15).unwrap().is_empty());
        let first = h.read_buffered(3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first[0].timestamp_us < first[2].timestamp_us);
        assert_eq!(h.read_buffered(15).unwrap().len(), 1);
        h.release().unwrap();
    }

    #[test]
    fn frame_noise_repeats_per_frame_not_across_frames() {
        let provider = SimProvider::new(vec![SimDeviceConfig {
            pixels: 64,
            ..SimDeviceConfig::with_serial("A")
        }]);
        let mut first = provider.enumerate().unwrap().remove(0);
        let mut second = provider.enumerate().unwrap().remove(0);

        let a0 = first.capture_raw_exposure().unwrap();
        let a1 = first.capture_raw_exposure().unwrap();
        let b0 = second.capture_raw_exposure().unwrap();
        assert_eq!(a0, b0);
        assert_ne!(a0, a1);
        first.release().unwrap();
        second.release().unwrap();
    }

    #[test]
    fn read_noise_has_configured_spread() {
        let mut noise = ReadNoise::for_frame(fnv1a(b"HR4P0001"), 0);
        let samples: Vec<f64> = (0..20_000).map(|_| noise.standard_normal()).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|z| (z - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }
}
