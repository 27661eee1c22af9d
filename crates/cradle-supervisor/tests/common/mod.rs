#![allow(dead_code)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Once,
    time::Duration,
};

use cradle_launch::{
    Config, Distribution, ExecutableConfig, ExtractedFileSet, LaunchContext, OsFamily,
};
use cradle_supervisor::SupervisorSettings;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Tracing for tests; output is only shown for failing tests.
///
/// `RUST_LOG=cradle=debug cargo test` for more.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

const YAML: &str = "\
cluster_name: 'Test Cluster'
native_transport_port: 9042
storage_port: 7000
ssl_storage_port: 7001
start_rpc: false
rpc_port: 9160
";

const JVM_OPTIONS: &str = "-Xss256k\n-XX:+UseNUMA\n";

const ENV_SH: &str = "JMX_PORT=\"7199\"\n";

/// What `bin/cassandra` does in the fake distribution.
pub enum Node {
    /// Runs the `cradle-fake-node` binary.
    Fake,
    /// Records its pid in `$CRADLE_PID_FILE`, then hangs without output.
    Silent,
    /// Prints a fatal line, then hangs.
    Fatal,
    /// Prints one line and exits with code 2.
    ExitEarly,
    /// A JVM error on stderr, then the CQL line on stdout; hangs after.
    FatalThenReady,
    /// Records its pid, ignores SIGTERM and hangs without output.
    Stubborn,
}

impl Node {
    fn script(&self) -> &'static str {
        match self {
            Node::Fake => "#!/bin/sh\nexec \"$CRADLE_FAKE_NODE\" \"$@\"\n",
            Node::Silent => "#!/bin/sh\necho $$ > \"$CRADLE_PID_FILE\"\nexec sleep 30\n",
            Node::Fatal => {
                "#!/bin/sh\necho 'ERROR Exception encountered during startup: bad things'\nexec sleep 30\n"
            }
            Node::ExitEarly => "#!/bin/sh\necho 'INFO booting'\nexit 2\n",
            Node::FatalThenReady => {
                "#!/bin/sh\necho 'Error occurred during initialization of VM' 1>&2\necho 'INFO Starting listening for CQL clients on /127.0.0.1:9042'\nexec sleep 30\n"
            }
            Node::Stubborn => {
                "#!/bin/sh\ntrap '' TERM\necho $$ > \"$CRADLE_PID_FILE\"\nwhile :; do sleep 1; done\n"
            }
        }
    }
}

/// A distribution tree under `root/dist` whose executable behaves like `node`.
pub fn distribution(root: &Path, node: Node) -> ExtractedFileSet {
    let files = ExtractedFileSet::from_home(root.join("dist"), OsFamily::Linux);
    std::fs::create_dir_all(&files.conf_dir).unwrap();
    std::fs::create_dir_all(files.executable.parent().unwrap()).unwrap();
    std::fs::write(files.conf_file("cassandra.yaml"), YAML).unwrap();
    std::fs::write(files.conf_file("jvm.options"), JVM_OPTIONS).unwrap();
    std::fs::write(files.conf_file("cassandra-env.sh"), ENV_SH).unwrap();

    std::fs::write(&files.executable, node.script()).unwrap();
    let mut perms = std::fs::metadata(&files.executable).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&files.executable, perms).unwrap();
    files
}

pub fn context(files: ExtractedFileSet, config: Config, executable: ExecutableConfig) -> LaunchContext {
    let mut executable = executable;
    executable.java_major = Some(8);
    executable.environment.insert(
        "CRADLE_FAKE_NODE".to_string(),
        env!("CARGO_BIN_EXE_cradle-fake-node").to_string(),
    );
    let mut dist = Distribution::current("3.11.6".parse().unwrap());
    dist.os = OsFamily::Linux;
    LaunchContext::new(config, executable, dist, files)
}

pub fn executable(startup_timeout: Duration, random_ports: bool) -> ExecutableConfig {
    ExecutableConfig {
        startup_timeout,
        use_random_ports: random_ports,
        ..ExecutableConfig::default()
    }
}

pub fn settings(work_root: PathBuf) -> SupervisorSettings {
    SupervisorSettings {
        stop_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        work_root,
        ..SupervisorSettings::default()
    }
}

pub fn is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Entries left in `dir`, or 0 when it does not exist.
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
