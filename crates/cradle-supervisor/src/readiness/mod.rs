//! Readiness detection: output markers first, then an optional socket check.

mod log_watcher;
pub mod signals;
pub mod socket_probe;

pub use log_watcher::{FailureCause, LogWatcher, ReadinessState};
pub use signals::SuccessSignal;
pub use socket_probe::ProbeTarget;
