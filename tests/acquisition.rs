use std::time::Duration;

use rusty_ocean::acquisition::{acquire_all, AcquisitionPlan, StopSignal};
use rusty_ocean::config::RetryPolicy;
use rusty_ocean::device::sim::{SimDeviceConfig, SimProvider};
use rusty_ocean::spectral::export::{self, OutputFormat};

fn flat_device(serial: &str, dark_level: f64) -> SimDeviceConfig {
    SimDeviceConfig {
        pixels: 256,
        dark_level,
        peak_counts: 0.0,
        noise: 0.0,
        nonlinearity_coefficients: vec![0.1],
        wavelength_coefficients: vec![400.0, 0.5, 0.0, 0.0],
        ..SimDeviceConfig::with_serial(serial)
    }
}

fn plan(exposures: usize) -> AcquisitionPlan {
    AcquisitionPlan {
        exposures,
        inter_exposure_delay: Duration::from_millis(1),
        retry: RetryPolicy {
            max_retries: 3,
            backoff_ms: 0,
        },
        ..AcquisitionPlan::default()
    }
}

#[test]
fn concurrent_sessions_keep_their_own_series() {
    let provider = SimProvider::new(vec![flat_device("A", 10.0), flat_device("B", 20.0)]);
    let serials = vec!["A".to_string(), "B".to_string()];

    let results = acquire_all(&provider, &serials, &plan(5), &StopSignal::new());
    assert_eq!(results.len(), 2);

    for result in results {
        let output = result.outcome.expect("session should succeed");
        assert_eq!(output.serial, result.serial);
        assert_eq!(output.len(), 5);

        // x + 0.1·x for the device's own flat level
        let expected = match result.serial.as_str() {
            "A" => 11.0,
            "B" => 22.0,
            other => panic!("unexpected serial {other}"),
        };
        for spectrum in &output.spectra {
            assert_eq!(spectrum.len(), output.wavelengths.len());
            assert!(spectrum.iter().all(|&v| (v - expected).abs() < 1e-9));
        }
    }

    for serial in ["A", "B"] {
        let counters = provider.counters(serial).unwrap();
        assert_eq!(counters.opened(), counters.released());
        assert_eq!(counters.used_after_release(), 0);
    }
}

#[test]
fn acquired_series_round_trips_through_csv() {
    let provider = SimProvider::new(vec![flat_device("A", 10.0)]);
    let mut results = acquire_all(&provider, &["A".to_string()], &plan(3), &StopSignal::new());
    let output = results.remove(0).outcome.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spectra.csv");
    export::save(&path, &output, OutputFormat::Csv).unwrap();

    let loaded = export::load_csv(&path).unwrap();
    assert_eq!(loaded.spectra.len(), 3);
    assert_eq!(loaded.wavelengths.len(), 256);
    assert_eq!(loaded.wavelengths[100], 450.0);
    assert!(loaded.spectra.iter().all(|s| s.iter().all(|&v| v == 11.0)));
}

#[test]
fn stopping_before_start_releases_nothing_and_reports_cancel() {
    let provider = SimProvider::new(vec![flat_device("A", 10.0)]);
    let stop = StopSignal::new();
    stop.stop();
    let results = acquire_all(&provider, &["A".to_string()], &plan(3), &stop);
    let err = results.into_iter().next().unwrap().outcome.unwrap_err();
    assert_eq!(err.kind(), rusty_ocean::ErrorKind::Cancelled);
    assert_eq!(provider.counters("A").unwrap().opened(), 0);
}

#[test]
fn stop_mid_run_cancels_every_session_and_releases_each_unit_once() {
    let provider = SimProvider::new(vec![flat_device("A", 10.0), flat_device("B", 20.0)]);
    let serials = vec!["A".to_string(), "B".to_string()];
    let plan = AcquisitionPlan {
        inter_exposure_delay: Duration::from_millis(20),
        ..plan(100)
    };
    let stop = StopSignal::new();

    let results = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(80));
            stop.stop();
        });
        acquire_all(&provider, &serials, &plan, &stop)
    });

    assert_eq!(results.len(), 2);
    for result in results {
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind(), rusty_ocean::ErrorKind::Cancelled);
        let counters = provider.counters(&result.serial).unwrap();
        assert!(counters.captures() > 0);
        assert_eq!(counters.released(), 1);
        assert_eq!(counters.used_after_release(), 0);
    }
}
