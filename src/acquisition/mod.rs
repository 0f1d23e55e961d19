/// Acquisition layer: binding to a device and pulling corrected spectra.
///
/// ```text
///   DeviceProvider ──enumerate──► handles
///        │                          │ serial match (bounded re-probe)
///        ▼                          ▼
///   ┌──────────┐   DeviceLease  ┌─────────┐
///   │  runner   │ ─────────────► │ session  │ Searching → Bound → Capturing → Closed
///   └──────────┘  one thread     └─────────┘        (Failed on any error)
///        ▲        per serial          │
///        └──── mpsc ◄── SessionOutput ┘  single or buffered capture
/// ```

mod buffered;
pub mod runner;
pub mod session;

pub use runner::{acquire_all, describe_devices, discover_serials, unique_serials, DeviceResult};
pub use session::{
    acquire, AcquisitionPlan, AcquisitionSession, CaptureMode, SessionState, StopSignal,
};
