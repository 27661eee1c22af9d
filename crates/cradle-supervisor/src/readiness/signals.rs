//! Output lines that decide a launch. Matched as plain substrings.

use cradle_launch::Config;

pub const CQL_STARTED: &str = "Starting listening for CQL";
pub const THRIFT_STARTED: &str = "Listening for thrift clients";
pub const MESSAGING_STARTED: &str = "Starting Messaging Service";

/// Checked in order; the first hit names the failure.
pub const FATAL_MARKERS: [&str; 8] = [
    "encountered during startup",
    "Missing required",
    "Address already in use",
    "Port already in use",
    "ConfigurationException",
    "syntax error near unexpected",
    "Error occurred during initialization",
    "Cassandra 3.0 and later require Java",
];

const PORT_CONFLICT_MARKERS: [&str; 2] = ["Address already in use", "Port already in use"];

/// Which line means "started", given the transports a launch enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessSignal {
    NativeTransport,
    Rpc,
    Messaging,
}

impl SuccessSignal {
    pub fn for_config(config: &Config) -> Self {
        if config.start_native_transport {
            Self::NativeTransport
        } else if config.start_rpc {
            Self::Rpc
        } else {
            Self::Messaging
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Self::NativeTransport => CQL_STARTED,
            Self::Rpc => THRIFT_STARTED,
            Self::Messaging => MESSAGING_STARTED,
        }
    }

    pub fn matches(self, line: &str) -> bool {
        line.contains(self.marker())
    }
}

pub fn fatal_marker(line: &str) -> Option<&'static str> {
    FATAL_MARKERS.iter().copied().find(|m| line.contains(m))
}

pub fn is_port_conflict(marker: &str) -> bool {
    PORT_CONFLICT_MARKERS.contains(&marker)
}
