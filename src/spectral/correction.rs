use super::model::{
    CorrectedSpectrum, NonlinearityCoefficients, RawSpectrum, WavelengthCoefficients,
    WavelengthTable,
};

// ---------------------------------------------------------------------------
// Nonlinearity correction
// ---------------------------------------------------------------------------

/// Apply the detector nonlinearity polynomial to every pixel:
///
/// `corrected = x + Σ c_i · x^(i+1)`
///
/// Pixels are independent. Results are not clamped, so corrected values may
/// be negative or exceed detector full scale.
pub fn correct_nonlinearity(
    raw: &RawSpectrum,
    coeffs: &NonlinearityCoefficients,
) -> CorrectedSpectrum {
    let terms = coeffs.as_slice();
    let values = raw
        .iter()
        .map(|&x| {
            let mut power = x;
            let mut correction = 0.0;
            for &c in terms {
                correction += c * power;
                power *= x;
            }
            x + correction
        })
        .collect();
    CorrectedSpectrum::new(values)
}

// ---------------------------------------------------------------------------
// Pixel → wavelength mapping
// ---------------------------------------------------------------------------

/// Evaluate the cubic calibration at `pixel`.
pub fn wavelength_at(coeffs: &WavelengthCoefficients, pixel: usize) -> f64 {
    let [c0, c1, c2, c3] = coeffs.terms();
    let p = pixel as f64;
    // Horner form of c0 + c1 p + c2 p² + c3 p³
    c0 + p * (c1 + p * (c2 + p * c3))
}

/// Build the wavelength axis for a detector with `pixel_count` pixels.
pub fn wavelength_table(coeffs: &WavelengthCoefficients, pixel_count: usize) -> WavelengthTable {
    WavelengthTable::new((0..pixel_count).map(|p| wavelength_at(coeffs, p)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn nl(coeffs: &[f64]) -> NonlinearityCoefficients {
        NonlinearityCoefficients::new(coeffs.to_vec()).unwrap()
    }

    #[test]
    fn empty_coefficients_are_identity() {
        let raw = RawSpectrum::new(vec![0.0, -3.5, 10.0, 65535.0, 1e-9]);
        let corrected = correct_nonlinearity(&raw, &nl(&[]));
        assert_eq!(&corrected[..], &raw[..]);
    }

    #[test]
    fn first_term_multiplies_raw_value() {
        // 10 + 0.1*10
        let raw = RawSpectrum::new(vec![10.0]);
        let corrected = correct_nonlinearity(&raw, &nl(&[0.1]));
        assert_relative_eq!(corrected[0], 11.0, epsilon = 1e-12);
    }

    #[test]
    fn higher_terms_use_increasing_powers() {
        // 2 + 0.5*2 + 0.25*4 + 0.125*8 = 5
        let raw = RawSpectrum::new(vec![2.0]);
        let corrected = correct_nonlinearity(&raw, &nl(&[0.5, 0.25, 0.125]));
        assert_relative_eq!(corrected[0], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn correction_is_not_clamped() {
        let raw = RawSpectrum::new(vec![100.0, 60000.0]);
        let corrected = correct_nonlinearity(&raw, &nl(&[-0.05, 1e-4]));
        // 100 - 0.05*100 + 1e-4*100^2 = 96
        assert_relative_eq!(corrected[0], 96.0, epsilon = 1e-9);
        assert!(corrected[1] > 65535.0);

        let negative = correct_nonlinearity(&RawSpectrum::new(vec![10.0]), &nl(&[-2.0]));
        assert!(negative[0] < 0.0);
    }

    #[test]
    fn correction_preserves_length_and_leaves_raw_untouched() {
        let raw = RawSpectrum::new((0..3648).map(|i| i as f64).collect());
        let before = raw.clone();
        let corrected = correct_nonlinearity(&raw, &nl(&[1e-6]));
        assert_eq!(corrected.len(), raw.len());
        assert_eq!(raw, before);
    }

    #[test]
    fn linear_calibration_maps_pixel_100() {
        let coeffs = WavelengthCoefficients::new([400.0, 0.5, 0.0, 0.0]);
        assert_relative_eq!(wavelength_at(&coeffs, 100), 450.0, epsilon = 1e-12);
    }

    #[test]
    fn cubic_calibration_matches_expanded_polynomial() {
        let coeffs = WavelengthCoefficients::new([186.5, 0.2818, -1.53e-5, -1.7e-10]);
        let table = wavelength_table(&coeffs, 3648);
        for &p in &[0usize, 1, 1000, 3647] {
            let x = p as f64;
            let expected = 186.5 + 0.2818 * x - 1.53e-5 * x * x - 1.7e-10 * x * x * x;
            assert_relative_eq!(table[p], expected, max_relative = 1e-12);
        }
    }

    #[test]
    fn table_length_matches_pixel_count() {
        let coeffs = WavelengthCoefficients::new([400.0, 0.5, 0.0, 0.0]);
        assert!(wavelength_table(&coeffs, 0).is_empty());
        assert_eq!(wavelength_table(&coeffs, 1).len(), 1);
        assert_eq!(wavelength_table(&coeffs, 2048).len(), 2048);
    }
}
