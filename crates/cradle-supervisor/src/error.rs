//! Failures surfaced by [`Supervisor::start`](crate::Supervisor::start).
//!
//! Every variant is reported only after the launch has been stopped and its
//! private files removed. Variants that stem from the node's own output carry
//! the last forwarded lines so a caller can tell a hang from a crash.

use std::time::Duration;

use cradle_launch::PortRole;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartError {
    /// A customizer step failed; nothing was spawned.
    #[error("configuration step '{step}' failed: {message}")]
    Configuration { step: &'static str, message: String },

    /// A port could not be bound, either before spawn or by the node itself.
    #[error("port conflict: {detail}")]
    PortConflict {
        role: Option<PortRole>,
        port: Option<u16>,
        detail: String,
        tail: Vec<String>,
    },

    /// A known-fatal line was printed, or the node exited before becoming ready.
    #[error("node failed to start: {reason}")]
    StartupFailure { reason: String, tail: Vec<String> },

    /// No decisive output before the deadline. The node was killed.
    #[error("node did not report startup within {timeout:?}")]
    StartupTimeout { timeout: Duration, tail: Vec<String> },

    /// The node logged it was listening but no client port accepted a connection.
    #[error("node reported ready but none of ports {ports:?} accepted a connection after {attempts} attempts")]
    TransportUnreachable { ports: Vec<u16>, attempts: u32 },

    /// The OS refused to spawn the executable.
    #[error("failed to launch node: {message}")]
    Launch { message: String },
}

impl StartError {
    /// Short stable label for logs.
    pub fn code(&self) -> &'static str {
        match self {
            StartError::Configuration { .. } => "configuration_error",
            StartError::PortConflict { .. } => "port_conflict",
            StartError::StartupFailure { .. } => "startup_failure",
            StartError::StartupTimeout { .. } => "startup_timeout",
            StartError::TransportUnreachable { .. } => "transport_unreachable",
            StartError::Launch { .. } => "launch_failed",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            StartError::Configuration { .. } => {
                "Check that the distribution's conf/ directory is complete and writable."
            }
            StartError::PortConflict { .. } => {
                "Pick other ports, or enable random ports to auto-assign free ones."
            }
            StartError::StartupFailure { .. } => "Read the output tail for the node's own error.",
            StartError::StartupTimeout { .. } => {
                "Raise the startup timeout, or read the output tail to see where the node stalled."
            }
            StartError::TransportUnreachable { .. } => {
                "Check the configured address and whether a firewall blocks local connections."
            }
            StartError::Launch { .. } => {
                "Ensure the executable exists and Java is installed (or JAVA_HOME is set)."
            }
        }
    }

    /// Last forwarded output lines, when the failure came from the node itself.
    pub fn tail(&self) -> &[String] {
        match self {
            StartError::PortConflict { tail, .. }
            | StartError::StartupFailure { tail, .. }
            | StartError::StartupTimeout { tail, .. } => tail,
            _ => &[],
        }
    }

    pub fn is_port_conflict(&self) -> bool {
        matches!(self, StartError::PortConflict { .. })
    }
}
