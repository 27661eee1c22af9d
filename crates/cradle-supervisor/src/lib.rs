//! Launches a Cassandra-style node from an extracted distribution and
//! supervises it until it is ready, failed, or timed out.

pub mod args;
pub mod customize;
pub mod error;
mod java;
pub mod launcher;
pub mod output;
pub mod port_alloc;
pub mod readiness;
mod run_info;
pub mod settings;
mod supervisor;

pub use error::StartError;
pub use readiness::{FailureCause, ReadinessState};
pub use settings::{SupervisorSettings, format_error_chain};
pub use supervisor::{Phase, ProcessHandle, StopOutcome, Supervisor};
