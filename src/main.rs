use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use rusty_ocean::acquisition::{self, AcquisitionPlan, CaptureMode, DeviceResult, StopSignal};
use rusty_ocean::device::sim::SimProvider;
use rusty_ocean::spectral::export::{self, OutputFormat};
use rusty_ocean::telemetry::{self, MonitorLimits};
use rusty_ocean::Config;

#[derive(Parser)]
#[command(name = "rusty-ocean")]
#[command(about = "Acquire corrected spectrometer data and serial telemetry to CSV")]
#[command(version)]
struct Cli {
    /// TOML file with timing, retry, telemetry and simulator settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached spectrometers.
    List {
        /// Print as JSON instead of one line per device.
        #[arg(long)]
        json: bool,
    },

    /// Acquire corrected spectra from one or more spectrometers.
    Acquire(AcquireArgs),

    /// Log power/temperature telemetry from the controller's serial port.
    Monitor(MonitorArgs),
}

#[derive(Debug, Clone, Args)]
struct AcquireArgs {
    /// Serial number to acquire from; repeat for several devices. Defaults
    /// to every attached device.
    #[arg(long = "serial")]
    serials: Vec<String>,

    /// Integration time per exposure in microseconds.
    #[arg(long)]
    exposure_us: Option<u32>,

    /// Number of exposures per device.
    #[arg(long)]
    count: Option<usize>,

    /// Output file. With several devices the serial number is appended to
    /// the file stem.
    #[arg(long)]
    output: PathBuf,

    /// Output format; guessed from the extension when omitted.
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Use the on-board data buffer (FX devices).
    #[arg(long)]
    buffered: bool,
}

#[derive(Debug, Clone, Args)]
struct MonitorArgs {
    /// Serial port, e.g. /dev/ttyACM0 or COM5.
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// CSV file to write.
    #[arg(long)]
    output: PathBuf,

    /// Stop after this many samples.
    #[arg(long)]
    max_records: Option<usize>,

    /// Stop after this many seconds.
    #[arg(long)]
    duration_secs: Option<f64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::List { json } => run_list(&config, json),
        Commands::Acquire(args) => run_acquire(&config, &args),
        Commands::Monitor(args) => run_monitor(&config, &args),
    }
}

/// A stop signal raised by the first Ctrl+C. A second Ctrl+C exits at once.
fn stop_on_ctrl_c() -> StopSignal {
    let stop = StopSignal::new();
    let raised = stop.clone();
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    warn!("Ctrl+C handling unavailable: {err}");
                    return;
                }
            };
            rt.block_on(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!("Ctrl+C handling unavailable: {err}");
                    return;
                }
                warn!("Interrupted, finishing the current step (Ctrl+C again to abort)");
                raised.stop();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        });
    if let Err(err) = spawned {
        warn!("Ctrl+C handling unavailable: {err}");
    }
    stop
}

fn provider(config: &Config) -> SimProvider {
    info!(
        "Using simulated backend with {} device(s)",
        config.simulator.devices.len()
    );
    SimProvider::new(config.simulator.devices.clone())
}

fn run_list(config: &Config, json: bool) -> Result<()> {
    let provider = provider(config);
    let infos = acquisition::describe_devices(&provider).context("listing devices")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else if infos.is_empty() {
        println!("No device found.");
    } else {
        for info in &infos {
            println!("{info}");
        }
    }
    Ok(())
}

fn run_acquire(config: &Config, args: &AcquireArgs) -> Result<()> {
    let provider = provider(config);

    let serials = if args.serials.is_empty() {
        acquisition::discover_serials(&provider).context("discovering devices")?
    } else {
        acquisition::unique_serials(&args.serials)
    };
    if serials.is_empty() {
        bail!("No device found.");
    }

    let mut plan = AcquisitionPlan::from_config(config);
    if let Some(us) = args.exposure_us {
        plan.exposure_time_us = us;
    }
    if let Some(count) = args.count {
        plan.exposures = count;
    }
    if args.buffered {
        plan.mode = CaptureMode::Buffered;
    }
    let format = args
        .format
        .unwrap_or_else(|| OutputFormat::from_path(&args.output));

    let stop = stop_on_ctrl_c();
    let results = acquisition::acquire_all(&provider, &serials, &plan, &stop);

    let failed = save_results(results, &args.output, format, serials.len() > 1);
    if failed > 0 {
        bail!("{failed} of {} devices failed", serials.len());
    }
    Ok(())
}

/// Write each successful session to its own file and report the number of
/// devices that failed, either in the session or while writing. A failed
/// write does not stop the remaining results from being saved.
fn save_results(
    results: Vec<DeviceResult>,
    output: &Path,
    format: OutputFormat,
    per_device: bool,
) -> usize {
    let mut failed = 0;
    for result in results {
        match result.outcome {
            Ok(spectra) => {
                let path = if per_device {
                    path_for_device(output, &result.serial)
                } else {
                    output.to_path_buf()
                };
                match export::save(&path, &spectra, format) {
                    Ok(()) => {
                        println!("{}: {} spectra -> {}", result.serial, spectra.len(), path.display())
                    }
                    Err(err) => {
                        failed += 1;
                        error!("{}: writing {} failed: {err}", result.serial, path.display());
                    }
                }
            }
            Err(err) => {
                failed += 1;
                error!("{}: {} ({})", result.serial, err, err.kind());
            }
        }
    }
    failed
}

/// `out/spectra.csv` + `HR4P0001` → `out/spectra_HR4P0001.csv`
fn path_for_device(output: &Path, serial: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("spectra");
    let name = match output.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{serial}.{ext}"),
        None => format!("{stem}_{serial}"),
    };
    output.with_file_name(name)
}

fn run_monitor(config: &Config, args: &MonitorArgs) -> Result<()> {
    let mut settings = config.telemetry.clone();
    if let Some(baud) = args.baud {
        settings.baud_rate = baud;
    }
    let Some(port) = args.port.clone().or_else(|| settings.port.clone()) else {
        bail!("no serial port given; pass --port or set telemetry.port in the config");
    };
    let duration = match args.duration_secs {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => bail!("invalid duration: {secs}"),
        None => None,
    };
    let limits = MonitorLimits {
        max_records: args.max_records,
        duration,
    };

    let stop = stop_on_ctrl_c();
    let summary = telemetry::run(&port, &settings, &args.output, &limits, &stop)
        .with_context(|| format!("logging telemetry from {port}"))?;
    if stop.is_stopped() {
        println!("Data logging stopped.");
    }
    println!(
        "{} samples written to {}",
        summary.records,
        args.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_files_get_serial_suffix() {
        assert_eq!(
            path_for_device(Path::new("out/spectra.csv"), "HR4P0001"),
            PathBuf::from("out/spectra_HR4P0001.csv")
        );
        assert_eq!(
            path_for_device(Path::new("run"), "FX2"),
            PathBuf::from("run_FX2")
        );
    }

    #[test]
    fn cli_parses_repeated_serials() {
        let cli = Cli::try_parse_from([
            "rusty-ocean",
            "acquire",
            "--serial",
            "A",
            "--serial",
            "B",
            "--count",
            "5",
            "--output",
            "s.parquet",
        ])
        .unwrap();
        match cli.command {
            Commands::Acquire(args) => {
                assert_eq!(args.serials, vec!["A", "B"]);
                assert_eq!(args.count, Some(5));
                assert_eq!(args.format, None);
            }
            _ => panic!("expected acquire"),
        }
    }

    #[test]
    fn failed_write_does_not_drop_other_devices() {
        use rusty_ocean::device::sim::SimDeviceConfig;

        let provider = SimProvider::new(vec![
            SimDeviceConfig {
                pixels: 8,
                ..SimDeviceConfig::with_serial("A")
            },
            SimDeviceConfig {
                pixels: 8,
                ..SimDeviceConfig::with_serial("B")
            },
        ]);
        let plan = AcquisitionPlan {
            exposures: 2,
            inter_exposure_delay: Duration::ZERO,
            ..AcquisitionPlan::default()
        };
        let serials = vec!["A".to_string(), "B".to_string()];
        let results = acquisition::acquire_all(&provider, &serials, &plan, &StopSignal::new());

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("spectra.csv");
        // A directory where A's file should go makes that write fail.
        std::fs::create_dir(dir.path().join("spectra_A.csv")).unwrap();

        let failed = save_results(results, &output, OutputFormat::Csv, true);
        assert_eq!(failed, 1);
        let saved = export::load_csv(&dir.path().join("spectra_B.csv")).unwrap();
        assert_eq!(saved.spectra.len(), 2);
    }
}
