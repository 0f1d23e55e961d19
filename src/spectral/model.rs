use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::CoefficientError;

// ---------------------------------------------------------------------------
// RawSpectrum – one exposure straight off the detector
// ---------------------------------------------------------------------------

/// Detector counts for a single exposure, indexed by pixel number.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpectrum(Vec<f64>);

impl RawSpectrum {
    pub fn new(counts: Vec<f64>) -> Self {
        RawSpectrum(counts)
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for RawSpectrum {
    fn from(counts: Vec<f64>) -> Self {
        RawSpectrum(counts)
    }
}

impl Deref for RawSpectrum {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// CorrectedSpectrum – raw counts after nonlinearity compensation
// ---------------------------------------------------------------------------

/// Nonlinearity-corrected intensities. Always a fresh buffer, never the raw one
/// rewritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedSpectrum(Vec<f64>);

impl CorrectedSpectrum {
    pub(crate) fn new(values: Vec<f64>) -> Self {
        CorrectedSpectrum(values)
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl Deref for CorrectedSpectrum {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Coefficient sets read from the device EEPROM
// ---------------------------------------------------------------------------

/// Polynomial nonlinearity coefficients `c0..ck`; `ci` multiplies `x^(i+1)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NonlinearityCoefficients(Vec<f64>);

impl NonlinearityCoefficients {
    /// Reject NaN/inf terms; an empty list is valid and means "no correction".
    pub fn new(coeffs: Vec<f64>) -> Result<Self, CoefficientError> {
        if let Some(index) = coeffs.iter().position(|c| !c.is_finite()) {
            return Err(CoefficientError::NotFinite { set: "nonlinearity", index });
        }
        Ok(NonlinearityCoefficients(coeffs))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cubic pixel → wavelength coefficients `[c0, c1, c2, c3]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct WavelengthCoefficients([f64; 4]);

impl WavelengthCoefficients {
    pub fn new(coeffs: [f64; 4]) -> Self {
        WavelengthCoefficients(coeffs)
    }

    /// Build from what the device reported. Fewer than four terms means the
    /// calibration profile is incomplete; missing terms are never zero-filled.
    /// Terms past the cubic one are ignored.
    pub fn from_slice(coeffs: &[f64]) -> Result<Self, CoefficientError> {
        if coeffs.len() < 4 {
            return Err(CoefficientError::TooFewWavelengthTerms { found: coeffs.len() });
        }
        if let Some(index) = coeffs[..4].iter().position(|c| !c.is_finite()) {
            return Err(CoefficientError::NotFinite { set: "wavelength", index });
        }
        Ok(WavelengthCoefficients([coeffs[0], coeffs[1], coeffs[2], coeffs[3]]))
    }

    pub fn terms(&self) -> [f64; 4] {
        self.0
    }
}

impl TryFrom<Vec<f64>> for WavelengthCoefficients {
    type Error = CoefficientError;

    fn try_from(coeffs: Vec<f64>) -> Result<Self, Self::Error> {
        WavelengthCoefficients::from_slice(&coeffs)
    }
}

impl From<WavelengthCoefficients> for Vec<f64> {
    fn from(coeffs: WavelengthCoefficients) -> Self {
        coeffs.0.to_vec()
    }
}

// ---------------------------------------------------------------------------
// WavelengthTable – the x axis shared by every exposure of a session
// ---------------------------------------------------------------------------

/// Wavelength (nm) for each pixel, computed once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthTable(Vec<f64>);

impl WavelengthTable {
    pub(crate) fn new(values: Vec<f64>) -> Self {
        WavelengthTable(values)
    }

    /// Wrap an axis read back from disk.
    pub fn from_values(values: Vec<f64>) -> Self {
        WavelengthTable(values)
    }
}

impl Deref for WavelengthTable {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// SessionOutput – everything one session hands back to its caller
// ---------------------------------------------------------------------------

/// The corrected series of one device, owned by whoever ran the session.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    /// Serial number of the device the series came from.
    pub serial: String,
    /// Exposure duration the device was configured with.
    pub exposure_time_us: u32,
    /// Shared x axis for every spectrum below.
    pub wavelengths: WavelengthTable,
    /// Corrected spectra in capture order.
    pub spectra: Vec<CorrectedSpectrum>,
}

impl SessionOutput {
    /// Number of exposures captured.
    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    /// Whether no exposure was captured.
    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavelength_coefficients_require_four_terms() {
        let err = WavelengthCoefficients::from_slice(&[400.0, 0.5, 0.0]).unwrap_err();
        assert!(matches!(err, CoefficientError::TooFewWavelengthTerms { found: 3 }));
    }

    #[test]
    fn wavelength_coefficients_ignore_extra_terms() {
        let c = WavelengthCoefficients::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(c.terms(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn nonlinearity_coefficients_reject_nan() {
        let err = NonlinearityCoefficients::new(vec![1.0, f64::NAN]).unwrap_err();
        assert!(matches!(err, CoefficientError::NotFinite { index: 1, .. }));
    }

    #[test]
    fn wavelength_coefficients_deserialize_from_list() {
        #[derive(Deserialize)]
        struct Profile {
            wavelength: WavelengthCoefficients,
        }
        let ok: Profile = toml::from_str("wavelength = [400.0, 0.5, 0.0, 0.0]").unwrap();
        assert_eq!(ok.wavelength.terms(), [400.0, 0.5, 0.0, 0.0]);
        assert!(toml::from_str::<Profile>("wavelength = [400.0]").is_err());
    }
}
