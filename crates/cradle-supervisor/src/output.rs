use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use cradle_launch::LaunchId;
use tokio::sync::mpsc;

pub const OUTPUT_TARGET: &str = "cradle::output";

/// Bounded window over a node's most recent output.
#[derive(Debug)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// The most recent `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }
}

/// Where every output line of one launch goes: the tracing target
/// [`OUTPUT_TARGET`], the launch's [`LogBuffer`], and an optional caller channel.
#[derive(Clone)]
pub struct LogSink {
    launch: LaunchId,
    buffer: Arc<Mutex<LogBuffer>>,
    forward_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(
        launch: LaunchId,
        max_lines: usize,
        forward_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            launch,
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
            forward_tx,
        }
    }

    pub fn emit(&self, line: &str) {
        tracing::info!(target: OUTPUT_TARGET, launch = %self.launch, "{line}");
        self.lock().push_line(line.to_string());
        if let Some(tx) = &self.forward_tx {
            // Receiver gone just means the caller stopped listening.
            let _ = tx.send(line.to_string());
        }
    }

    pub fn tail(&self, limit: usize) -> Vec<String> {
        self.lock().tail(limit)
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}
