use std::{path::PathBuf, time::Duration};

const DEFAULT_LOG_MAX_LINES: usize = 1000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Knobs that shape how a launch is driven, independent of the node's own config.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Upper bound for `stop()` before the process group is killed outright.
    pub stop_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// How long `stop()` waits for the output reader to drain.
    pub reader_join_timeout: Duration,
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
    pub log_max_lines: usize,
    /// Parent of launch-private work dirs.
    pub work_root: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            reader_join_timeout: Duration::from_secs(2),
            probe_attempts: 10,
            probe_timeout: Duration::from_millis(500),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            work_root: std::env::temp_dir(),
        }
    }
}

impl SupervisorSettings {
    /// Defaults overridden by `CRADLE_*` environment variables, clamped to sane ranges.
    pub fn from_env() -> Self {
        let d = Self::default();
        let stop_timeout = Duration::from_millis(
            env_u64("CRADLE_STOP_TIMEOUT_MS")
                .map(|v| v.clamp(500, 5 * 60 * 1000))
                .unwrap_or(d.stop_timeout.as_millis() as u64),
        );
        let stop_grace = Duration::from_millis(
            env_u64("CRADLE_STOP_GRACE_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(d.stop_grace.as_millis() as u64),
        )
        .min(stop_timeout);

        Self {
            stop_timeout,
            stop_grace,
            reader_join_timeout: Duration::from_millis(
                env_u64("CRADLE_READER_JOIN_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(d.reader_join_timeout.as_millis() as u64),
            ),
            probe_attempts: env_u64("CRADLE_PROBE_ATTEMPTS")
                .map(|v| v.clamp(1, 1000) as u32)
                .unwrap_or(d.probe_attempts),
            probe_timeout: Duration::from_millis(
                env_u64("CRADLE_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(50, 30_000))
                    .unwrap_or(d.probe_timeout.as_millis() as u64),
            ),
            log_max_lines: env_usize("CRADLE_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
            work_root: std::env::var_os("CRADLE_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.work_root),
        }
    }
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
