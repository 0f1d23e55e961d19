use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;

use log::{debug, info, warn};

use super::session::{AcquisitionPlan, AcquisitionSession, StopSignal};
use crate::device::{DeviceHandle, DeviceInfo, DeviceLease, DeviceProvider};
use crate::error::AcquisitionError;
use crate::spectral::model::SessionOutput;

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Serial numbers of every attached unit. Each handle is released right after
/// its serial is read; units whose serial cannot be read are skipped.
pub fn discover_serials<P: DeviceProvider>(provider: &P) -> Result<Vec<String>, AcquisitionError> {
    let handles = provider.enumerate().map_err(AcquisitionError::Enumeration)?;
    let mut serials = Vec::with_capacity(handles.len());
    for handle in handles {
        let mut lease = DeviceLease::new(handle);
        match lease.serial_number() {
            Ok(serial) => {
                lease.set_label(&serial);
                serials.push(serial);
            }
            Err(err) => warn!("Could not read serial number: {err}"),
        }
    }
    info!("Device serial numbers: {}", serials.join(", "));
    Ok(serials)
}

/// Like [`discover_serials`], with revision, pixel count and buffer support.
pub fn describe_devices<P: DeviceProvider>(provider: &P) -> Result<Vec<DeviceInfo>, AcquisitionError> {
    let handles = provider.enumerate().map_err(AcquisitionError::Enumeration)?;
    let mut infos = Vec::with_capacity(handles.len());
    for handle in handles {
        let mut lease = DeviceLease::new(handle);
        let serial = match lease.serial_number() {
            Ok(serial) => serial,
            Err(err) => {
                warn!("Could not read serial number: {err}");
                continue;
            }
        };
        lease.set_label(&serial);
        let revision = lease
            .revision()
            .inspect_err(|err| debug!("Device {serial}: no revision info ({err})"))
            .ok();
        let pixels = lease.formatted_spectrum_length().ok();
        let data_buffer = lease.supports_data_buffer();
        infos.push(DeviceInfo {
            serial,
            pixels,
            revision,
            data_buffer,
        });
    }
    Ok(infos)
}

// ---------------------------------------------------------------------------
// Concurrent acquisition
// ---------------------------------------------------------------------------

/// Outcome of one device's session.
#[derive(Debug)]
pub struct DeviceResult {
    pub serial: String,
    pub outcome: Result<SessionOutput, AcquisitionError>,
}

/// `serials` in first-seen order with repeats dropped.
pub fn unique_serials(serials: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(serials.len());
    let mut unique = Vec::with_capacity(serials.len());
    for serial in serials {
        if seen.insert(serial.as_str()) {
            unique.push(serial.clone());
        } else {
            warn!("Serial {serial} requested more than once, acquiring it once");
        }
    }
    unique
}

/// Run one session per distinct serial, each on its own worker thread.
///
/// Workers share nothing but the provider; each sends its owned result back
/// over a channel, so results arrive in completion order. One failed session
/// does not affect the others. A serial listed twice still gets a single
/// session, since two sessions cannot hold the same unit.
pub fn acquire_all<P: DeviceProvider>(
    provider: &P,
    serials: &[String],
    plan: &AcquisitionPlan,
    stop: &StopSignal,
) -> Vec<DeviceResult> {
    let serials = unique_serials(serials);
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for serial in &serials {
            let worker_tx = tx.clone();
            let worker_plan = plan.clone();
            let worker_stop = stop.clone();
            let spawned = thread::Builder::new()
                .name(format!("acq-{serial}"))
                .spawn_scoped(scope, move || {
                    let mut session = AcquisitionSession::new(provider, serial, worker_plan);
                    let outcome = session.run(&worker_stop);
                    // The receiver outlives the scope, so this cannot fail.
                    let _ = worker_tx.send(DeviceResult {
                        serial: serial.clone(),
                        outcome,
                    });
                });
            if let Err(err) = spawned {
                warn!("Could not start worker for {serial}, running inline: {err}");
                let mut session = AcquisitionSession::new(provider, serial, plan.clone());
                let _ = tx.send(DeviceResult {
                    serial: serial.clone(),
                    outcome: session.run(stop),
                });
            }
        }
    });
    drop(tx);

    rx.into_iter().collect()
}
