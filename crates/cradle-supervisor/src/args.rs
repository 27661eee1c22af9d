//! Command-line construction, keyed on the launch platform.

use std::path::{Path, PathBuf};

use cradle_launch::OsFamily;

/// Env var the node's startup script appends to the JVM command line.
pub const EXTRA_JVM_OPTS_ENV: &str = "JVM_EXTRA_OPTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Wrapped in a PowerShell invocation; `-D` args are backtick-escaped.
    Windows,
    /// Executable invoked directly. `root` adds the script's run-as-root flag.
    Posix { root: bool },
}

impl Platform {
    pub fn for_os(os: OsFamily) -> Self {
        if os.is_windows() {
            Platform::Windows
        } else {
            Platform::Posix {
                root: running_as_root(),
            }
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Program, argv and any JVM options that must travel through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub extra_jvm_opts: Option<String>,
}

impl CommandLine {
    /// Full argv for logs and run.json.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

pub struct ArgsBuilder {
    platform: Platform,
    executable: PathBuf,
    jvm_options: Vec<String>,
}

impl ArgsBuilder {
    pub fn new(platform: Platform, executable: &Path) -> Self {
        Self {
            platform,
            executable: executable.to_path_buf(),
            jvm_options: Vec::new(),
        }
    }

    /// JVM options for distributions without an options file.
    pub fn jvm_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jvm_options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> CommandLine {
        // The startup script only accepts `-D` on its command line.
        let (props, extra): (Vec<String>, Vec<String>) = self
            .jvm_options
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .partition(|o| o.starts_with("-D"));
        let extra_jvm_opts = (!extra.is_empty()).then(|| extra.join(" "));

        match self.platform {
            Platform::Windows => {
                let mut args = vec![
                    "-ExecutionPolicy".to_string(),
                    "Unrestricted".to_string(),
                    self.executable.display().to_string(),
                    "-f".to_string(),
                ];
                args.extend(props.into_iter().map(|p| format!("`{p}")));
                CommandLine {
                    program: PathBuf::from("powershell"),
                    args,
                    extra_jvm_opts,
                }
            }
            Platform::Posix { root } => {
                let mut args = vec!["-f".to_string()];
                if root {
                    args.push("-R".to_string());
                }
                args.extend(props);
                CommandLine {
                    program: self.executable,
                    args,
                    extra_jvm_opts,
                }
            }
        }
    }
}
