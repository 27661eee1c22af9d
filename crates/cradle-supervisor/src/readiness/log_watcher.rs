use std::fmt;

use super::signals::{SuccessSignal, fatal_marker};
use crate::output::LogSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// A known-fatal line; `marker` is the first listed marker it contains.
    FatalLine { marker: &'static str, line: String },
    /// Output ended before any decisive line.
    Exited { code: Option<i32> },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::FatalLine { line, .. } => write!(f, "{line}"),
            FailureCause::Exited { code: Some(code) } => {
                write!(f, "process exited with code {code} before reporting startup")
            }
            FailureCause::Exited { code: None } => {
                write!(f, "process exited before reporting startup")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadinessState {
    #[default]
    Waiting,
    Succeeded,
    Failed(FailureCause),
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Waiting)
    }
}

/// Decides readiness from a node's output, one line at a time.
///
/// The state leaves `Waiting` at most once; later lines are still forwarded
/// to the sink but never change the outcome.
pub struct LogWatcher {
    signal: SuccessSignal,
    state: ReadinessState,
    sink: LogSink,
}

impl LogWatcher {
    pub fn new(signal: SuccessSignal, sink: LogSink) -> Self {
        Self {
            signal,
            state: ReadinessState::Waiting,
            sink,
        }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    /// Forward `line` and return the new state if this line decided the launch.
    pub fn observe(&mut self, line: &str) -> Option<ReadinessState> {
        self.sink.emit(line);

        if self.state.is_terminal() {
            return None;
        }
        // Fatal wins when one line carries both.
        if let Some(marker) = fatal_marker(line) {
            return self.latch(ReadinessState::Failed(FailureCause::FatalLine {
                marker,
                line: line.to_string(),
            }));
        }
        if self.signal.matches(line) {
            return self.latch(ReadinessState::Succeeded);
        }
        None
    }

    /// Output is exhausted. A still-waiting watcher fails with the exit code, if known.
    pub fn close(&mut self, code: Option<i32>) -> Option<ReadinessState> {
        self.latch(ReadinessState::Failed(FailureCause::Exited { code }))
    }

    fn latch(&mut self, next: ReadinessState) -> Option<ReadinessState> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = next;
        Some(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use cradle_launch::LaunchId;
    use proptest::prelude::*;

    use super::*;
    use crate::readiness::signals::FATAL_MARKERS;

    fn watcher(signal: SuccessSignal) -> (LogWatcher, LogSink) {
        let sink = LogSink::new(LaunchId::new(), 100, None);
        (LogWatcher::new(signal, sink.clone()), sink)
    }

    #[test]
    fn success_line_latches() {
        let (mut w, _) = watcher(SuccessSignal::NativeTransport);
        assert_eq!(w.observe("INFO  Initializing system_schema"), None);
        assert_eq!(
            w.observe("INFO  Starting listening for CQL clients on /127.0.0.1:9042"),
            Some(ReadinessState::Succeeded)
        );
        assert_eq!(w.observe("ERROR Exception encountered during startup"), None);
        assert_eq!(w.state(), &ReadinessState::Succeeded);
    }

    #[test]
    fn fatal_line_latches_with_marker() {
        let (mut w, _) = watcher(SuccessSignal::NativeTransport);
        let next = w.observe("java.net.BindException: Address already in use").unwrap();
        match next {
            ReadinessState::Failed(FailureCause::FatalLine { marker, .. }) => {
                assert_eq!(marker, "Address already in use")
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(w.observe("Starting listening for CQL clients"), None);
    }

    #[test]
    fn other_transport_line_is_not_success() {
        let (mut w, _) = watcher(SuccessSignal::Rpc);
        assert_eq!(w.observe("Starting listening for CQL clients"), None);
        assert_eq!(
            w.observe("Listening for thrift clients..."),
            Some(ReadinessState::Succeeded)
        );
    }

    #[test]
    fn each_fatal_marker_latches_inside_other_text() {
        for marker in FATAL_MARKERS {
            let (mut w, _) = watcher(SuccessSignal::NativeTransport);
            let line = format!("ERROR [main] 12:00:01 prefix {marker} suffix");
            match w.observe(&line) {
                Some(ReadinessState::Failed(FailureCause::FatalLine { marker: m, line: l })) => {
                    assert_eq!(m, marker);
                    assert_eq!(l, line);
                }
                other => panic!("{marker}: unexpected transition {other:?}"),
            }
            assert_eq!(w.observe("INFO Starting listening for CQL clients"), None, "{marker}");
            assert!(matches!(w.state(), ReadinessState::Failed(_)), "{marker}");
        }
    }

    #[test]
    fn signals_do_not_match_each_other() {
        let all = [
            SuccessSignal::NativeTransport,
            SuccessSignal::Rpc,
            SuccessSignal::Messaging,
        ];
        for signal in all {
            for other in all.into_iter().filter(|o| *o != signal) {
                let (mut w, _) = watcher(signal);
                let line = format!("INFO  {} on /127.0.0.1", other.marker());
                assert_eq!(w.observe(&line), None, "{signal:?} fed {other:?}");
                assert_eq!(w.state(), &ReadinessState::Waiting, "{signal:?} fed {other:?}");
            }
        }
    }

    #[test]
    fn close_while_waiting_fails_with_exit() {
        let (mut w, _) = watcher(SuccessSignal::Messaging);
        assert_eq!(
            w.close(Some(1)),
            Some(ReadinessState::Failed(FailureCause::Exited { code: Some(1) }))
        );
        assert_eq!(w.close(Some(2)), None);
    }

    #[test]
    fn close_after_success_changes_nothing() {
        let (mut w, _) = watcher(SuccessSignal::Messaging);
        w.observe("Starting Messaging Service on port 7000");
        assert_eq!(w.close(None), None);
        assert_eq!(w.state(), &ReadinessState::Succeeded);
    }

    #[test]
    fn every_line_is_forwarded() {
        let (mut w, sink) = watcher(SuccessSignal::NativeTransport);
        w.observe("a");
        w.observe("Starting listening for CQL clients");
        w.observe("b");
        assert_eq!(sink.tail(10), vec!["a", "Starting listening for CQL clients", "b"]);
    }

    fn any_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z ]{0,20}",
            Just("Starting listening for CQL clients".to_string()),
            Just("Starting Messaging Service".to_string()),
            proptest::sample::select(FATAL_MARKERS.to_vec()).prop_map(str::to_string),
        ]
    }

    proptest! {
        #[test]
        fn state_changes_at_most_once(lines in proptest::collection::vec(any_line(), 0..40)) {
            let (mut w, _) = watcher(SuccessSignal::NativeTransport);
            let mut transitions = 0;
            let mut first = None;
            for line in &lines {
                if let Some(s) = w.observe(line) {
                    transitions += 1;
                    first.get_or_insert(s);
                }
            }
            if w.close(None).is_some() {
                transitions += 1;
            }
            prop_assert_eq!(transitions, 1);
            if let Some(first) = first {
                prop_assert_eq!(w.state(), &first);
            }
        }
    }
}
