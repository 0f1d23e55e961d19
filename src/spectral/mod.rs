/// Spectral layer: core types, corrections, and export.
///
/// Architecture:
/// ```text
///   device capture
///        │  RawSpectrum
///        ▼
///   ┌────────────┐
///   │ correction  │  nonlinearity polynomial → CorrectedSpectrum
///   └────────────┘  calibration cubic        → WavelengthTable (once per session)
///        │
///        ▼
///   ┌──────────────┐
///   │ SessionOutput │  serial, WavelengthTable, Vec<CorrectedSpectrum>
///   └──────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  export   │  .csv (pixel rows) / .parquet (exposure rows)
///   └──────────┘
/// ```

pub mod correction;
pub mod export;
pub mod model;
