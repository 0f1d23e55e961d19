//! Serial telemetry logger for the heater controller board.
//!
//! The board prints one line per sample:
//!
//! ```text
//! <time s>,<% power output>,<RTD 1 °C>,<RTD 2 °C>,<average °C>
//! ```
//!
//! Anything else on the line (boot banners, debug prints, torn lines) is
//! skipped. Every accepted sample is appended to a CSV file and flushed, so
//! killing the logger loses nothing already received.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use thiserror::Error;

use crate::acquisition::StopSignal;
use crate::config::TelemetrySettings;
use crate::error::TelemetryError;

/// CSV header, in field order.
pub const HEADER: [&str; 5] = [
    "Time (s)",
    "% Power Output",
    "RTD Temp1 (C)",
    "RTD Temp2 (C)",
    "Avg Temp (C)",
];

// ---------------------------------------------------------------------------
// TelemetryRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub time_s: f64,
    pub power_pct: f64,
    pub rtd_temp1_c: f64,
    pub rtd_temp2_c: f64,
    pub avg_temp_c: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("field {field} is not a number: '{value}'")]
    NotANumber { field: usize, value: String },
}

impl FromStr for TelemetryRecord {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != HEADER.len() {
            return Err(RecordError::FieldCount(fields.len()));
        }
        let mut values = [0.0; 5];
        for (field, (slot, raw)) in values.iter_mut().zip(&fields).enumerate() {
            *slot = raw.trim().parse().map_err(|_| RecordError::NotANumber {
                field,
                value: raw.to_string(),
            })?;
        }
        let [time_s, power_pct, rtd_temp1_c, rtd_temp2_c, avg_temp_c] = values;
        Ok(TelemetryRecord {
            time_s,
            power_pct,
            rtd_temp1_c,
            rtd_temp2_c,
            avg_temp_c,
        })
    }
}

// ---------------------------------------------------------------------------
// Monitor loop
// ---------------------------------------------------------------------------

/// When to stop logging besides end of stream and the stop signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorLimits {
    pub max_records: Option<usize>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub records: usize,
    pub skipped: usize,
}

/// Read telemetry lines from `reader` and log them as CSV into `out`.
///
/// Read timeouts are treated as "no data yet"; bytes of a line received before
/// a timeout are kept until the rest of the line arrives.
pub fn monitor<R: BufRead, W: Write>(
    mut reader: R,
    out: W,
    limits: &MonitorLimits,
    stop: &StopSignal,
) -> Result<MonitorSummary, TelemetryError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(HEADER)?;
    writer.flush()?;

    let started = Instant::now();
    let mut summary = MonitorSummary::default();
    let mut line = Vec::new();

    loop {
        if stop.is_stopped() {
            info!("Data logging stopped");
            break;
        }
        if limits.max_records.is_some_and(|max| summary.records >= max) {
            break;
        }
        if limits.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }

        let complete = match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                if !line.is_empty() {
                    handle_line(&line, &mut writer, &mut summary)?;
                }
                debug!("Telemetry stream closed");
                break;
            }
            Ok(_) => line.last() == Some(&b'\n'),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                false
            }
            Err(err) => return Err(err.into()),
        };

        if complete {
            handle_line(&line, &mut writer, &mut summary)?;
            line.clear();
        }
    }

    writer.flush()?;
    Ok(summary)
}

fn handle_line<W: Write>(
    raw: &[u8],
    writer: &mut csv::Writer<W>,
    summary: &mut MonitorSummary,
) -> Result<(), TelemetryError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    match text.parse::<TelemetryRecord>() {
        Ok(record) => {
            writer.serialize(record)?;
            writer.flush()?;
            summary.records += 1;
            info!(
                "Time: {}, % Power Output: {}, Temp1: {}, Temp2: {}, Avg Temp: {}",
                record.time_s,
                record.power_pct,
                record.rtd_temp1_c,
                record.rtd_temp2_c,
                record.avg_temp_c
            );
        }
        Err(err) => {
            summary.skipped += 1;
            debug!("Skipping line '{text}': {err}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Serial port glue
// ---------------------------------------------------------------------------

/// Open the board's port and wait for it to come out of reset.
pub fn open_port(port: &str, settings: &TelemetrySettings) -> Result<Box<dyn SerialPort>, TelemetryError> {
    let handle = serialport::new(port, settings.baud_rate)
        .timeout(Duration::from_millis(settings.read_timeout_ms))
        .open()
        .map_err(|source| TelemetryError::Open {
            port: port.to_string(),
            baud_rate: settings.baud_rate,
            source,
        })?;
    debug!("Serial port '{port}' opened at {} baud", settings.baud_rate);
    sleep(Duration::from_millis(settings.settle_delay_ms));
    Ok(handle)
}

/// Log the board on `port` into a CSV at `output` until a limit or the stop
/// signal is hit.
pub fn run(
    port: &str,
    settings: &TelemetrySettings,
    output: &Path,
    limits: &MonitorLimits,
    stop: &StopSignal,
) -> Result<MonitorSummary, TelemetryError> {
    let serial = open_port(port, settings)?;
    let file = File::create(output)?;
    let summary = monitor(BufReader::new(serial), file, limits, stop)?;
    if summary.skipped > 0 {
        warn!("Skipped {} malformed telemetry lines", summary.skipped);
    }
    info!("CSV file saved at: {}", output.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn parses_five_numeric_fields() {
        let r: TelemetryRecord = " 12.5, 40, 101.2,99.8 ,100.5\r".parse().unwrap();
        assert_eq!(r.time_s, 12.5);
        assert_eq!(r.power_pct, 40.0);
        assert_eq!(r.avg_temp_c, 100.5);
    }

    #[test]
    fn rejects_wrong_field_count_and_text() {
        assert_eq!(
            "1,2,3,4".parse::<TelemetryRecord>(),
            Err(RecordError::FieldCount(4))
        );
        assert_eq!(
            "1,2,3,4,5,6".parse::<TelemetryRecord>(),
            Err(RecordError::FieldCount(6))
        );
        assert!(matches!(
            "1,2,three,4,5".parse::<TelemetryRecord>(),
            Err(RecordError::NotANumber { field: 2, .. })
        ));
    }

    #[test]
    fn logs_valid_lines_and_skips_noise() {
        let input = "Booting...\n0.5,10,25.1,25.3,25.2\n\ngarbage,line\n1.0,12,25.4,25.6,25.5";
        let mut out = Vec::new();
        let summary = monitor(
            Cursor::new(input),
            &mut out,
            &MonitorLimits::default(),
            &StopSignal::new(),
        )
        .unwrap();

        assert_eq!(summary, MonitorSummary { records: 2, skipped: 2 });
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Time (s),% Power Output,RTD Temp1 (C),RTD Temp2 (C),Avg Temp (C)"
        );
        assert_eq!(lines[1], "0.5,10.0,25.1,25.3,25.2");
        assert_eq!(lines[2], "1.0,12.0,25.4,25.6,25.5");
    }

    #[test]
    fn stops_at_record_limit() {
        let input = "1,1,1,1,1\n2,2,2,2,2\n3,3,3,3,3\n";
        let limits = MonitorLimits {
            max_records: Some(2),
            duration: None,
        };
        let summary = monitor(Cursor::new(input), Vec::new(), &limits, &StopSignal::new()).unwrap();
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn stop_signal_ends_logging_with_header_written() {
        let stop = StopSignal::new();
        stop.stop();
        let mut out = Vec::new();
        let summary = monitor(
            Cursor::new("1,1,1,1,1\n"),
            &mut out,
            &MonitorLimits::default(),
            &stop,
        )
        .unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    /// Serves its chunks one read at a time with a timeout between them, as a
    /// serial port does when a line straddles the read timeout.
    struct Stuttering {
        chunks: Vec<&'static [u8]>,
        timed_out: bool,
    }

    impl Read for Stuttering {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            self.timed_out = false;
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn line_split_by_timeout_is_reassembled() {
        let port = Stuttering {
            chunks: vec![b"3.0,50,30", b".5,30.7,30.6\n"],
            timed_out: false,
        };
        let mut out = Vec::new();
        let summary = monitor(
            BufReader::new(port),
            &mut out,
            &MonitorLimits::default(),
            &StopSignal::new(),
        )
        .unwrap();
        assert_eq!(summary.records, 1);
        assert!(String::from_utf8(out).unwrap().contains("3.0,50.0,30.5,30.7,30.6"));
    }

    /// Raises the stop signal as soon as the port hands over its first bytes.
    struct InterruptedPort<'a> {
        data: Cursor<&'static [u8]>,
        stop: &'a StopSignal,
    }

    impl Read for InterruptedPort<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;
            self.stop.stop();
            Ok(n)
        }
    }

    #[test]
    fn stop_raised_mid_stream_keeps_records_already_read() {
        let stop = StopSignal::new();
        let port = InterruptedPort {
            data: Cursor::new(&b"1,1,1,1,1\n2,2,2,2,2\n"[..]),
            stop: &stop,
        };
        let mut out = Vec::new();
        let summary = monitor(BufReader::new(port), &mut out, &MonitorLimits::default(), &stop).unwrap();

        assert_eq!(summary.records, 1);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with("1.0,1.0,1.0,1.0,1.0\n"));
    }
}
