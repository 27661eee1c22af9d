//! Drives one node from context to a ready process (or a typed failure).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use cradle_launch::{Config, LaunchContext, LaunchId, PortAssignment, PortRole, Version};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::args::{ArgsBuilder, Platform};
use crate::customize::{JMX_PORT_PROPERTY, Pipeline, Staging, WorkDir, numa_capable, resolve_unset_ports};
use crate::error::StartError;
use crate::java::detect_java_major;
use crate::launcher::{self, Exit, Launch, RunningProcess, Termination, wait_exited};
use crate::output::LogSink;
use crate::port_alloc::{PortAllocator, PortCheckError, ensure_available};
use crate::readiness::{
    FailureCause, LogWatcher, ProbeTarget, ReadinessState, SuccessSignal, signals, socket_probe,
};
use crate::run_info::{RunInfo, write_run_json};
use crate::settings::{SupervisorSettings, format_error_chain};

/// Lines of output attached to failures.
const TAIL_LINES: usize = 50;
/// How long the reader waits for an exit code once output has closed.
const EXIT_AFTER_EOF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Configuring,
    Launching,
    AwaitingReady,
    Ready,
    Failed,
    TimedOut,
}

fn enter(id: &LaunchId, phase: Phase) {
    info!(launch = %id, ?phase, "launch phase");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub termination: Termination,
    pub reader_joined: bool,
    pub work_dir_removed: bool,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    output_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorSettings::from_env())
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            output_tx: None,
        }
    }

    /// Also send every output line of launched nodes to `tx`.
    pub fn with_output(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Configure, spawn and wait for the node described by `ctx`.
    ///
    /// Any failure kills the process and removes the launch-private files
    /// before it is returned.
    pub async fn start(&self, ctx: &LaunchContext) -> Result<ProcessHandle, StartError> {
        let id = ctx.id.clone();
        enter(&id, Phase::New);

        enter(&id, Phase::Configuring);
        let ctx = with_java_version(ctx).await;
        let mut allocator = PortAllocator::new();
        let ports = prepare_ports(&ctx, &mut allocator)?;

        let scratch = self.create_scratch(&id)?;
        let work = WorkDir::stage(&ctx.files, scratch.path()).map_err(|e| {
            StartError::Configuration {
                step: "stage",
                message: format_error_chain(&e),
            }
        })?;
        let mut staging = Staging {
            ctx: &ctx,
            work: &work,
            ports,
            allocator: &mut allocator,
        };
        Pipeline::standard(numa_capable(&ctx.distribution)).run(&mut staging)?;
        let ports = staging.ports;
        debug!(launch = %id, ?ports, work = %work.root().display(), "configuration staged");

        enter(&id, Phase::Launching);
        let launch = build_launch(&ctx, &work, &ports);
        let mut process = launcher::spawn(&launch).map_err(|e| StartError::Launch {
            message: format_error_chain(&e),
        })?;
        let pid = process.pid();
        info!(launch = %id, ?pid, argv = ?launch.command.argv(), "node spawned");

        let mut run = RunInfo::new(
            id.clone(),
            ctx.distribution.version,
            launch.command.argv(),
            &launch.cwd,
            ports,
            launch.child_env(),
        );
        run.pid = pid;
        if let Err(e) = write_run_json(work.root(), &run).await {
            warn!(launch = %id, error = %format_error_chain(&e), "failed to write run.json");
        }

        enter(&id, Phase::AwaitingReady);
        let sink = LogSink::new(
            id.clone(),
            self.settings.log_max_lines,
            self.output_tx.clone(),
        );
        let watcher = LogWatcher::new(SuccessSignal::for_config(&ctx.config), sink.clone());
        let (state_tx, mut state_rx) = watch::channel(ReadinessState::Waiting);
        let exit_rx = process.exit_watch();
        let reader = match process.take_output() {
            Some(lines) => tokio::spawn(drive_readiness(lines, watcher, state_tx, exit_rx.clone())),
            None => tokio::spawn(async {}),
        };

        let handle = ProcessHandle {
            id: id.clone(),
            pid,
            ports,
            work_dir: work.root().to_path_buf(),
            sink,
            exit_rx,
            stop_settings: StopSettings::from(&self.settings),
            lifecycle: Mutex::new(Lifecycle::Live(Live {
                process,
                reader,
                scratch,
            })),
        };

        let timeout = ctx.executable.startup_timeout;
        let decided =
            match tokio::time::timeout(timeout, state_rx.wait_for(|s| s.is_terminal())).await {
                Ok(Ok(state)) => Some(state.clone()),
                // Reader gone without a verdict.
                Ok(Err(_)) => Some(ReadinessState::Failed(FailureCause::Exited { code: None })),
                Err(_) => None,
            };
        let Some(state) = decided else {
            enter(&id, Phase::TimedOut);
            handle.kill().await;
            return Err(StartError::StartupTimeout {
                timeout,
                tail: handle.logs_tail(TAIL_LINES),
            });
        };
        if let ReadinessState::Failed(cause) = state {
            enter(&id, Phase::Failed);
            handle.kill().await;
            return Err(failure_error(cause, handle.logs_tail(TAIL_LINES)));
        }

        if ctx.executable.verify_transport && socket_probe::is_enabled(&ctx.config) {
            let target = ProbeTarget::new(&ctx.config, &ports);
            if let Err(e) = socket_probe::check_connection(
                &target,
                self.settings.probe_attempts,
                self.settings.probe_timeout,
            )
            .await
            {
                enter(&id, Phase::Failed);
                handle.kill().await;
                return Err(e);
            }
        }

        enter(&id, Phase::Ready);
        Ok(handle)
    }

    fn create_scratch(&self, id: &LaunchId) -> Result<tempfile::TempDir, StartError> {
        let root = &self.settings.work_root;
        std::fs::create_dir_all(root)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix(&format!("cradle-{id}-"))
                    .tempdir_in(root)
            })
            .with_context(|| format!("create work dir under {}", root.display()))
            .map_err(|e| StartError::Configuration {
                step: "stage",
                message: format_error_chain(&e),
            })
    }
}

/// `ctx` with the JVM major version filled in when it can be detected.
async fn with_java_version(ctx: &LaunchContext) -> LaunchContext {
    let mut ctx = ctx.clone();
    if ctx.executable.java_major.is_none() {
        match detect_java_major(ctx.executable.java_home.as_deref()).await {
            Ok(major) => {
                debug!(launch = %ctx.id, java = major, "detected java version");
                ctx.executable.java_major = Some(major);
            }
            Err(e) => {
                warn!(launch = %ctx.id, error = %format_error_chain(&e), "java version unknown");
            }
        }
    }
    ctx
}

/// Ports the node itself will bind, given its config and version.
fn bound_roles(config: &Config, version: &Version) -> Vec<PortRole> {
    let mut roles = vec![PortRole::Storage, PortRole::Jmx];
    if config.start_native_transport {
        roles.push(PortRole::NativeTransport);
        roles.push(PortRole::NativeTransportSsl);
    }
    if config.start_rpc && version.major < 4 {
        roles.push(PortRole::Rpc);
    }
    roles
}

/// Fixed ports are checked and reserved; unset ones resolved. With random
/// ports on, the pipeline reassigns everything instead.
fn prepare_ports(
    ctx: &LaunchContext,
    allocator: &mut PortAllocator,
) -> Result<PortAssignment, StartError> {
    let mut ports = PortAssignment::from_config(&ctx.config);
    if ctx.executable.use_random_ports {
        return Ok(ports);
    }

    for (_, port) in ports.roles() {
        allocator.reserve(port);
    }
    for role in bound_roles(&ctx.config, &ctx.distribution.version) {
        let Some(port) = ports.get(role).filter(|p| *p != 0) else {
            continue;
        };
        match ensure_available(port) {
            Ok(()) => {}
            Err(PortCheckError::InUse(port)) => {
                return Err(StartError::PortConflict {
                    role: Some(role),
                    port: Some(port),
                    detail: format!("{role} port {port} is already in use"),
                    tail: Vec::new(),
                });
            }
            Err(e) => {
                // Not a conflict; let the node report it if it matters.
                debug!(launch = %ctx.id, %role, port, error = %e, "port pre-check inconclusive");
            }
        }
    }

    resolve_unset_ports(&mut ports, allocator).map_err(|e| StartError::Configuration {
        step: "ports",
        message: format_error_chain(&e),
    })?;
    Ok(ports)
}

fn build_launch(ctx: &LaunchContext, work: &WorkDir, ports: &PortAssignment) -> Launch {
    let exe = &ctx.executable;
    let mut builder = ArgsBuilder::new(Platform::for_os(ctx.distribution.os), &ctx.files.executable);
    if work.jvm_options_file().is_none() {
        builder = builder
            .jvm_options(exe.jvm_options.iter().cloned())
            .jvm_options([format!("{JMX_PORT_PROPERTY}={}", ports.jmx)]);
    }

    let mut env = BTreeMap::new();
    env.insert("CASSANDRA_CONF".to_string(), path_string(&work.conf_dir()));
    env.insert("CASSANDRA_LOG_DIR".to_string(), path_string(&work.logs_dir()));
    if let Some(home) = &exe.java_home {
        env.insert("JAVA_HOME".to_string(), path_string(home));
    }
    env.extend(exe.environment.clone());

    Launch {
        command: builder.build(),
        cwd: ctx.files.home().to_path_buf(),
        env,
    }
}

fn path_string(p: &Path) -> String {
    p.display().to_string()
}

fn failure_error(cause: FailureCause, tail: Vec<String>) -> StartError {
    match cause {
        FailureCause::FatalLine { marker, line } if signals::is_port_conflict(marker) => {
            StartError::PortConflict {
                role: None,
                port: None,
                detail: line,
                tail,
            }
        }
        other => StartError::StartupFailure {
            reason: other.to_string(),
            tail,
        },
    }
}

/// Single reader: every line through the watcher in order, then the exit code.
async fn drive_readiness(
    mut lines: mpsc::UnboundedReceiver<String>,
    mut watcher: LogWatcher,
    state_tx: watch::Sender<ReadinessState>,
    exit_rx: watch::Receiver<Exit>,
) {
    while let Some(line) = lines.recv().await {
        if let Some(next) = watcher.observe(&line) {
            let _ = state_tx.send(next);
        }
    }
    if watcher.state().is_terminal() {
        return;
    }
    let code = wait_exited(exit_rx, EXIT_AFTER_EOF).await.flatten();
    if let Some(next) = watcher.close(code) {
        let _ = state_tx.send(next);
    }
}

#[derive(Debug, Clone, Copy)]
struct StopSettings {
    timeout: Duration,
    grace: Duration,
    reader_join: Duration,
}

impl From<&SupervisorSettings> for StopSettings {
    fn from(s: &SupervisorSettings) -> Self {
        Self {
            timeout: s.stop_timeout,
            grace: s.stop_grace.min(s.stop_timeout),
            reader_join: s.reader_join_timeout,
        }
    }
}

struct Live {
    process: RunningProcess,
    reader: JoinHandle<()>,
    scratch: tempfile::TempDir,
}

enum Lifecycle {
    Live(Live),
    Stopped(StopOutcome),
}

/// A running node.
///
/// Dropping the handle without [`stop`](Self::stop) still kills the process
/// group and removes the work directory, without waiting.
pub struct ProcessHandle {
    id: LaunchId,
    pid: Option<u32>,
    ports: PortAssignment,
    work_dir: PathBuf,
    sink: LogSink,
    exit_rx: watch::Receiver<Exit>,
    stop_settings: StopSettings,
    lifecycle: Mutex<Lifecycle>,
}

impl ProcessHandle {
    pub fn id(&self) -> &LaunchId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ports after customization, as the node was told to bind them.
    pub fn ports(&self) -> PortAssignment {
        self.ports
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn logs_tail(&self, limit: usize) -> Vec<String> {
        self.sink.tail(limit)
    }

    /// Exit code once the process is gone, `None` while it runs.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        match *self.exit_rx.borrow() {
            Exit::Running => None,
            Exit::Exited(code) => Some(code),
        }
    }

    /// Resolves when the process exits on its own (or is stopped).
    pub async fn exited(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(|e| matches!(e, Exit::Exited(_))).await {
            Ok(exit) => match *exit {
                Exit::Exited(code) => code,
                Exit::Running => None,
            },
            Err(_) => None,
        }
    }

    /// Terminate the node and release its files. Later calls return the first outcome.
    pub async fn stop(&self) -> StopOutcome {
        self.finish(self.stop_settings).await
    }

    /// Like [`stop`](Self::stop) but with no SIGTERM grace: the process group
    /// is killed right away. Shares the outcome latch with `stop`.
    pub async fn kill(&self) -> StopOutcome {
        self.finish(StopSettings {
            grace: Duration::ZERO,
            ..self.stop_settings
        })
        .await
    }

    async fn finish(&self, settings: StopSettings) -> StopOutcome {
        let mut lifecycle = self.lifecycle.lock().await;
        let live = match std::mem::replace(
            &mut *lifecycle,
            Lifecycle::Stopped(StopOutcome {
                termination: Termination::Unresponsive,
                reader_joined: false,
                work_dir_removed: false,
            }),
        ) {
            Lifecycle::Stopped(outcome) => {
                *lifecycle = Lifecycle::Stopped(outcome);
                return outcome;
            }
            Lifecycle::Live(live) => live,
        };

        let outcome = stop_live(&self.id, live, settings).await;
        *lifecycle = Lifecycle::Stopped(outcome);
        outcome
    }
}

async fn stop_live(id: &LaunchId, live: Live, settings: StopSettings) -> StopOutcome {
    let Live {
        mut process,
        mut reader,
        scratch,
    } = live;

    let termination = process.terminate(settings.grace, settings.timeout).await;
    match termination {
        Termination::Unresponsive => {
            warn!(launch = %id, pid = ?process.pid(), "node did not exit before the stop timeout")
        }
        t => info!(launch = %id, pid = ?process.pid(), termination = ?t, "node stopped"),
    }

    let reader_joined = match tokio::time::timeout(settings.reader_join, &mut reader).await {
        Ok(_) => true,
        Err(_) => {
            warn!(launch = %id, "output reader still busy after stop; detaching");
            reader.abort();
            false
        }
    };
    drop(process);

    let path = scratch.path().to_path_buf();
    let work_dir_removed = match scratch.close() {
        Ok(()) => true,
        Err(e) => {
            warn!(launch = %id, path = %path.display(), error = %e, "failed to remove work dir");
            false
        }
    };

    StopOutcome {
        termination,
        reader_joined,
        work_dir_removed,
    }
}

#[cfg(test)]
mod tests {
    use cradle_launch::OsFamily;

    use super::*;
    use crate::customize::test_support::{context, fake_distribution};

    #[test]
    fn fatal_bind_line_is_a_port_conflict() {
        let err = failure_error(
            FailureCause::FatalLine {
                marker: "Address already in use",
                line: "java.net.BindException: Address already in use".to_string(),
            },
            vec!["x".to_string()],
        );
        assert!(err.is_port_conflict());
        assert_eq!(err.tail(), ["x".to_string()]);
    }

    #[test]
    fn other_fatal_line_is_a_startup_failure() {
        let err = failure_error(
            FailureCause::FatalLine {
                marker: "ConfigurationException",
                line: "ConfigurationException: bad yaml".to_string(),
            },
            vec![],
        );
        match err {
            StartError::StartupFailure { reason, .. } => assert!(reason.contains("bad yaml")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn early_exit_is_a_startup_failure() {
        let err = failure_error(FailureCause::Exited { code: Some(1) }, vec![]);
        assert_eq!(err.code(), "startup_failure");
    }

    #[test]
    fn rpc_is_not_bound_on_four_x() {
        let config = Config {
            start_rpc: true,
            ..Config::default()
        };
        assert!(bound_roles(&config, &"3.11.6".parse().unwrap()).contains(&PortRole::Rpc));
        assert!(!bound_roles(&config, &"4.0.1".parse().unwrap()).contains(&PortRole::Rpc));
    }

    #[test]
    fn taken_fixed_port_is_rejected_before_spawn() {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(fake_distribution(tmp.path(), OsFamily::Linux), OsFamily::Linux, "3.11.6");
        ctx.config.native_transport_port = taken;
        ctx.config.storage_port = 0;
        ctx.config.jmx_port = 0;

        let err = prepare_ports(&ctx, &mut PortAllocator::new()).unwrap_err();
        match err {
            StartError::PortConflict { role, port, .. } => {
                assert_eq!(role, Some(PortRole::NativeTransport));
                assert_eq!(port, Some(taken));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unset_ports_are_resolved_when_not_random() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(fake_distribution(tmp.path(), OsFamily::Linux), OsFamily::Linux, "3.11.6");
        ctx.config.native_transport_port = 0;
        ctx.config.storage_port = 0;
        ctx.config.ssl_storage_port = 0;
        ctx.config.rpc_port = 0;
        ctx.config.jmx_port = 0;

        let ports = prepare_ports(&ctx, &mut PortAllocator::new()).unwrap();
        assert!(ports.roles().all(|(_, p)| p != 0));
    }

    #[test]
    fn options_go_on_argv_without_options_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = context(fake_distribution(tmp.path(), OsFamily::Linux), OsFamily::Linux, "2.2.19");
        ctx.executable.jvm_options = vec!["-Dfoo=1".to_string(), "-Xmx256m".to_string()];
        ctx.executable.environment.insert("EXTRA".to_string(), "1".to_string());
        let work = WorkDir::stage(&ctx.files, &tmp.path().join("work")).unwrap();
        std::fs::remove_file(work.conf_dir().join("jvm.options")).unwrap();
        let ports = PortAssignment::from_config(&ctx.config);

        let launch = build_launch(&ctx, &work, &ports);
        assert!(launch.command.args.contains(&"-Dfoo=1".to_string()));
        assert!(launch.command.args.contains(&"-Dcassandra.jmx.local.port=7199".to_string()));
        assert_eq!(launch.command.extra_jvm_opts.as_deref(), Some("-Xmx256m"));
        assert_eq!(launch.env["CASSANDRA_CONF"], work.conf_dir().display().to_string());
        assert_eq!(launch.env["EXTRA"], "1");
        assert_eq!(launch.cwd, ctx.files.home);
    }

    #[test]
    fn options_file_keeps_argv_short() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(fake_distribution(tmp.path(), OsFamily::Linux), OsFamily::Linux, "3.11.6");
        let work = WorkDir::stage(&ctx.files, &tmp.path().join("work")).unwrap();
        let launch = build_launch(&ctx, &work, &PortAssignment::from_config(&ctx.config));
        assert!(launch.command.args.iter().all(|a| !a.starts_with("-D")));
    }
}
