use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

/// Identifies one launch attempt. Used to name the launch-private work dir.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchId(pub String);

impl LaunchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node settings written into `cassandra.yaml`.
///
/// A port of `0` means "resolve a free port at launch time".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub start_native_transport: bool,
    pub start_rpc: bool,
    pub native_transport_port: u16,
    pub native_transport_port_ssl: Option<u16>,
    pub rpc_port: u16,
    pub storage_port: u16,
    pub ssl_storage_port: u16,
    pub jmx_port: u16,
    pub cluster_name: String,
    pub address: IpAddr,
    /// Extra top-level `key: value` pairs, written verbatim.
    pub settings: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_native_transport: true,
            start_rpc: false,
            native_transport_port: 9042,
            native_transport_port_ssl: None,
            rpc_port: 9160,
            storage_port: 7000,
            ssl_storage_port: 7001,
            jmx_port: 7199,
            cluster_name: "Test Cluster".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JvmOptionsMode {
    /// Append options, never deleting existing lines.
    #[default]
    Add,
    /// Drop existing options with the same flag name before appending.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutableConfig {
    #[serde(rename = "startup_timeout_ms", deserialize_with = "millis")]
    pub startup_timeout: Duration,
    pub jvm_options: Vec<String>,
    pub jvm_options_mode: JvmOptionsMode,
    pub use_random_ports: bool,
    /// Confirm a logged startup with a TCP connect before reporting ready.
    pub verify_transport: bool,
    pub java_home: Option<PathBuf>,
    /// JVM major version the node will run on. Detected when absent.
    pub java_major: Option<u32>,
    pub environment: BTreeMap<String, String>,
}

impl Default for ExecutableConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(90),
            jvm_options: Vec::new(),
            jvm_options_mode: JvmOptionsMode::Add,
            use_random_ports: false,
            verify_transport: true,
            java_home: None,
            java_major: None,
            environment: BTreeMap::new(),
        }
    }
}

fn millis<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(d).map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }

    pub fn is_windows(self) -> bool {
        matches!(self, Self::Windows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuWidth {
    Bits32,
    Bits64,
}

impl CpuWidth {
    pub fn current() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Bits64
        } else {
            Self::Bits32
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid version '{0}': expected MAJOR[.MINOR[.PATCH]]")]
pub struct InvalidVersion(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Newest JVM major version this release line was built to run on.
    pub fn target_java_major(&self) -> u32 {
        if self.major >= 4 { 11 } else { 8 }
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32, InvalidVersion> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| InvalidVersion(s.to_string())),
                None if required => Err(InvalidVersion(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(InvalidVersion(s.to_string()));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for Version {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Distribution {
    #[serde(default = "OsFamily::current")]
    pub os: OsFamily,
    #[serde(default = "CpuWidth::current")]
    pub cpu: CpuWidth,
    pub version: Version,
}

impl Distribution {
    /// Distribution of `version` for the host platform.
    pub fn current(version: Version) -> Self {
        Self {
            os: OsFamily::current(),
            cpu: CpuWidth::current(),
            version,
        }
    }
}

/// Paths inside an already-extracted distribution. Shared, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtractedFileSet {
    pub home: PathBuf,
    pub executable: PathBuf,
    pub conf_dir: PathBuf,
}

impl ExtractedFileSet {
    /// Standard layout: `bin/cassandra` (or `bin/cassandra.ps1`) and `conf/`.
    pub fn from_home(home: impl Into<PathBuf>, os: OsFamily) -> Self {
        let home = home.into();
        let exe = if os.is_windows() {
            "cassandra.ps1"
        } else {
            "cassandra"
        };
        Self {
            executable: home.join("bin").join(exe),
            conf_dir: home.join("conf"),
            home,
        }
    }

    pub fn conf_file(&self, name: &str) -> PathBuf {
        self.conf_dir.join(name)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    NativeTransport,
    NativeTransportSsl,
    Rpc,
    Storage,
    SslStorage,
    Jmx,
}

impl PortRole {
    /// `cassandra.yaml` key for this role. JMX is a system property instead.
    pub fn yaml_key(self) -> Option<&'static str> {
        match self {
            Self::NativeTransport => Some("native_transport_port"),
            Self::NativeTransportSsl => Some("native_transport_port_ssl"),
            Self::Rpc => Some("rpc_port"),
            Self::Storage => Some("storage_port"),
            Self::SslStorage => Some("ssl_storage_port"),
            Self::Jmx => None,
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NativeTransport => "native_transport",
            Self::NativeTransportSsl => "native_transport_ssl",
            Self::Rpc => "rpc",
            Self::Storage => "storage",
            Self::SslStorage => "ssl_storage",
            Self::Jmx => "jmx",
        };
        f.write_str(s)
    }
}

/// Effective ports of one launch. `0` marks a port that still has to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortAssignment {
    pub native_transport: u16,
    pub native_transport_ssl: Option<u16>,
    pub rpc: u16,
    pub storage: u16,
    pub ssl_storage: u16,
    pub jmx: u16,
}

impl PortAssignment {
    pub const REQUIRED: [PortRole; 5] = [
        PortRole::NativeTransport,
        PortRole::Rpc,
        PortRole::Storage,
        PortRole::SslStorage,
        PortRole::Jmx,
    ];

    pub fn from_config(config: &Config) -> Self {
        Self {
            native_transport: config.native_transport_port,
            native_transport_ssl: config.native_transport_port_ssl,
            rpc: config.rpc_port,
            storage: config.storage_port,
            ssl_storage: config.ssl_storage_port,
            jmx: config.jmx_port,
        }
    }

    pub fn get(&self, role: PortRole) -> Option<u16> {
        match role {
            PortRole::NativeTransport => Some(self.native_transport),
            PortRole::NativeTransportSsl => self.native_transport_ssl,
            PortRole::Rpc => Some(self.rpc),
            PortRole::Storage => Some(self.storage),
            PortRole::SslStorage => Some(self.ssl_storage),
            PortRole::Jmx => Some(self.jmx),
        }
    }

    /// Sets `role`. The optional ssl native port is only overwritten when present.
    pub fn set(&mut self, role: PortRole, port: u16) {
        match role {
            PortRole::NativeTransport => self.native_transport = port,
            PortRole::NativeTransportSsl => {
                if self.native_transport_ssl.is_some() {
                    self.native_transport_ssl = Some(port);
                }
            }
            PortRole::Rpc => self.rpc = port,
            PortRole::Storage => self.storage = port,
            PortRole::SslStorage => self.ssl_storage = port,
            PortRole::Jmx => self.jmx = port,
        }
    }

    /// Every role that has a value, required roles first.
    pub fn roles(&self) -> impl Iterator<Item = (PortRole, u16)> + '_ {
        Self::REQUIRED
            .into_iter()
            .chain(std::iter::once(PortRole::NativeTransportSsl))
            .filter_map(|role| self.get(role).map(|p| (role, p)))
    }

    /// Client-facing ports that are switched on in `config`.
    pub fn client_ports(&self, config: &Config) -> Vec<u16> {
        let mut out = Vec::new();
        if config.start_native_transport {
            out.push(self.native_transport);
            if let Some(ssl) = self.native_transport_ssl {
                out.push(ssl);
            }
        }
        if config.start_rpc {
            out.push(self.rpc);
        }
        out
    }
}

/// Everything one launch attempt needs. Built once, never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchContext {
    #[serde(default)]
    pub id: LaunchId,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub executable: ExecutableConfig,
    pub distribution: Distribution,
    pub files: ExtractedFileSet,
}

impl LaunchContext {
    pub fn new(
        config: Config,
        executable: ExecutableConfig,
        distribution: Distribution,
        files: ExtractedFileSet,
    ) -> Self {
        Self {
            id: LaunchId::new(),
            config,
            executable,
            distribution,
            files,
        }
    }

    /// Same launch with the JVM major version pinned.
    pub fn with_java_major(mut self, major: u32) -> Self {
        self.executable.java_major = Some(major);
        self
    }
}
