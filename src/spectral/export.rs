use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Float64Builder, Int64Array, ListBuilder, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use log::info;
use parquet::arrow::ArrowWriter;

use super::model::{CorrectedSpectrum, SessionOutput, WavelengthTable};
use crate::error::ExportError;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// On-disk layout for an acquired series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// `Wavelength,Spectrum_1,...` with one row per pixel.
    Csv,
    /// One row per exposure with `x`/`y` list columns.
    Parquet,
}

impl OutputFormat {
    /// Guess the format from a file extension. Unknown extensions fall back
    /// to CSV.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "parquet" | "pq" => OutputFormat::Parquet,
            _ => OutputFormat::Csv,
        }
    }
}

/// Write a session's series to `path` in the given format.
pub fn save(path: &Path, output: &SessionOutput, format: OutputFormat) -> Result<(), ExportError> {
    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match format {
        OutputFormat::Csv => write_csv(BufWriter::new(file), &output.wavelengths, &output.spectra)?,
        OutputFormat::Parquet => write_parquet(file, output)?,
    }
    info!(
        "Saved {} spectra from {} to {}",
        output.len(),
        output.serial,
        path.display()
    );
    Ok(())
}

fn check_lengths(wavelengths: &[f64], spectra: &[CorrectedSpectrum]) -> Result<(), ExportError> {
    for (index, sp) in spectra.iter().enumerate() {
        if sp.len() != wavelengths.len() {
            return Err(ExportError::LengthMismatch {
                index,
                expected: wavelengths.len(),
                found: sp.len(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CSV writer / reader
// ---------------------------------------------------------------------------

/// CSV layout: header `Wavelength,Spectrum_1,...,Spectrum_N`, then one row per
/// pixel holding the wavelength followed by each exposure's intensity.
pub fn write_csv<W: Write>(
    out: W,
    wavelengths: &[f64],
    spectra: &[CorrectedSpectrum],
) -> Result<(), ExportError> {
    check_lengths(wavelengths, spectra)?;

    let mut writer = csv::Writer::from_writer(out);

    let mut header = Vec::with_capacity(spectra.len() + 1);
    header.push("Wavelength".to_string());
    header.extend((1..=spectra.len()).map(|i| format!("Spectrum_{i}")));
    writer.write_record(&header)?;

    let mut row: Vec<String> = Vec::with_capacity(spectra.len() + 1);
    for (pixel, wl) in wavelengths.iter().enumerate() {
        row.clear();
        row.push(wl.to_string());
        row.extend(spectra.iter().map(|sp| sp[pixel].to_string()));
        writer.write_record(&row)?;
    }

    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Spectra file read back from disk: the wavelength axis plus one intensity
/// column per exposure.
#[derive(Debug, Clone)]
pub struct LoadedSpectra {
    pub wavelengths: WavelengthTable,
    pub spectra: Vec<Vec<f64>>,
}

/// Load a CSV written by [`write_csv`].
pub fn load_csv(path: &Path) -> Result<LoadedSpectra, ExportError> {
    let file = File::open(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv(file)
}

pub fn read_csv<R: Read>(input: R) -> Result<LoadedSpectra, ExportError> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers()?.clone();

    if headers.get(0) != Some("Wavelength") {
        return Err(ExportError::Malformed(
            "first column must be 'Wavelength'".to_string(),
        ));
    }
    let n_spectra = headers.len() - 1;

    let mut wavelengths = Vec::new();
    let mut spectra = vec![Vec::new(); n_spectra];

    for (row_no, result) in reader.records().enumerate() {
        let record = result?;
        let mut values = record.iter().enumerate().map(|(col, tok)| {
            tok.trim().parse::<f64>().map_err(|_| {
                ExportError::Malformed(format!("row {row_no}, column {col}: '{tok}' is not a number"))
            })
        });
        match values.next() {
            Some(wl) => wavelengths.push(wl?),
            None => continue,
        }
        for column in spectra.iter_mut() {
            let value = values.next().ok_or_else(|| {
                ExportError::Malformed(format!("row {row_no} is missing intensity values"))
            })??;
            column.push(value);
        }
    }

    Ok(LoadedSpectra {
        wavelengths: WavelengthTable::from_values(wavelengths),
        spectra,
    })
}

// ---------------------------------------------------------------------------
// Parquet writer
// ---------------------------------------------------------------------------

/// Parquet layout, one row per exposure:
/// - `x`: List<Float64> – wavelength axis (repeated per row)
/// - `y`: List<Float64> – corrected intensities
/// - `serial`, `exposure`, `exposure_time_us` – metadata columns
pub fn write_parquet<W: Write + Send>(out: W, output: &SessionOutput) -> Result<(), ExportError> {
    check_lengths(&output.wavelengths, &output.spectra)?;

    let mut x_builder = ListBuilder::new(Float64Builder::new());
    let mut y_builder = ListBuilder::new(Float64Builder::new());
    for sp in &output.spectra {
        x_builder.values().append_slice(&output.wavelengths);
        x_builder.append(true);
        y_builder.values().append_slice(sp);
        y_builder.append(true);
    }
    let x_array = x_builder.finish();
    let y_array = y_builder.finish();

    let n = output.spectra.len();
    let serial_array = StringArray::from(vec![output.serial.as_str(); n]);
    let exposure_array = Int64Array::from((1..=n as i64).collect::<Vec<_>>());
    let time_array = Int64Array::from(vec![i64::from(output.exposure_time_us); n]);

    let item = || Arc::new(Field::new("item", DataType::Float64, true));
    let schema = Arc::new(Schema::new(vec![
        Field::new("x", DataType::List(item()), false),
        Field::new("y", DataType::List(item()), false),
        Field::new("serial", DataType::Utf8, false),
        Field::new("exposure", DataType::Int64, false),
        Field::new("exposure_time_us", DataType::Int64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(x_array),
            Arc::new(y_array),
            Arc::new(serial_array),
            Arc::new(exposure_array),
            Arc::new(time_array),
        ],
    )?;

    let mut writer = ArrowWriter::try_new(out, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}
