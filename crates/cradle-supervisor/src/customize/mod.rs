//! Config customizer pipeline.
//!
//! Every launch gets a private copy of the distribution's `conf/` directory.
//! The steps below rewrite that copy in a fixed order; the shared distribution
//! is never touched. A failing step aborts the launch before anything is
//! spawned. Steps already applied are not rolled back: the copy is private to
//! the attempt and is deleted with it.

mod java_compat;
mod jvm_options;
mod main_config;
mod numa;
mod random_ports;

use std::{
    fs,
    path::{Path, PathBuf},
};

use cradle_launch::{ExtractedFileSet, LaunchContext, OsFamily, PortAssignment};
use tracing::debug;

use crate::error::StartError;
use crate::port_alloc::PortAllocator;
use crate::settings::format_error_chain;

pub use java_compat::JavaCompatCustomizer;
pub use jvm_options::{JvmOptionsCustomizer, apply_jvm_options, flag_name};
pub use main_config::{MainConfigCustomizer, upsert_yaml_keys};
pub use numa::{NumaCustomizer, numa_capable};
pub use random_ports::{RandomPortCustomizer, resolve_unset_ports};

pub const CONFIG_FILE: &str = "cassandra.yaml";
pub const ENV_SCRIPT: &str = "cassandra-env.sh";
const JVM_OPTIONS_FILES: [&str; 2] = ["jvm.options", "jvm-server.options"];

pub const JMX_PORT_PROPERTY: &str = "-Dcassandra.jmx.local.port";

/// Launch-private copy of the distribution's configuration plus data dirs.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Copy `files.conf_dir` into `root/conf` and create the data layout.
    pub fn stage(files: &ExtractedFileSet, root: &Path) -> anyhow::Result<Self> {
        let work = Self {
            root: root.to_path_buf(),
        };
        copy_dir_recursive(&files.conf_dir, &work.conf_dir())?;
        for dir in ["data", "commitlog", "saved_caches", "hints", "logs"] {
            fs::create_dir_all(work.data_root().join(dir))?;
        }
        Ok(work)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root().join("logs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.conf_dir().join(CONFIG_FILE)
    }

    pub fn jvm_options_file(&self) -> Option<PathBuf> {
        JVM_OPTIONS_FILES
            .iter()
            .map(|name| self.conf_dir().join(name))
            .find(|p| p.is_file())
    }

    /// Shell environment script; Windows distributions have none we rewrite.
    pub fn env_script(&self, os: OsFamily) -> Option<PathBuf> {
        if os.is_windows() {
            return None;
        }
        let p = self.conf_dir().join(ENV_SCRIPT);
        p.is_file().then_some(p)
    }
}

/// Mutable state threaded through the pipeline for one launch.
pub struct Staging<'a> {
    pub ctx: &'a LaunchContext,
    pub work: &'a WorkDir,
    pub ports: PortAssignment,
    pub allocator: &'a mut PortAllocator,
}

impl Staging<'_> {
    /// System properties that must reach the JVM for this launch.
    pub fn system_properties(&self) -> Vec<String> {
        vec![format!("{JMX_PORT_PROPERTY}={}", self.ports.jmx)]
    }
}

pub trait FileCustomizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()>;
}

/// Fixed, ordered list of customizers.
pub struct Pipeline {
    steps: Vec<Box<dyn FileCustomizer>>,
}

impl Pipeline {
    pub fn standard(numa_capable: bool) -> Self {
        Self {
            steps: vec![
                Box::new(MainConfigCustomizer),
                Box::new(JvmOptionsCustomizer),
                Box::new(JavaCompatCustomizer),
                Box::new(NumaCustomizer::new(numa_capable)),
                Box::new(RandomPortCustomizer),
            ],
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, staging: &mut Staging<'_>) -> Result<(), StartError> {
        for step in &self.steps {
            debug!(launch = %staging.ctx.id, step = step.name(), "applying customizer");
            step.customize(staging)
                .map_err(|e| StartError::Configuration {
                    step: step.name(),
                    message: format_error_chain(&e),
                })?;
        }
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)
        .map_err(|e| anyhow::anyhow!("read conf dir {}: {e}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        // `metadata` follows symlinks, so linked files and dirs are copied by content.
        let meta = fs::metadata(&src_path)
            .map_err(|e| anyhow::anyhow!("failed to resolve {}: {e}", src_path.display()))?;
        if meta.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if meta.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Replace `path` through a sibling temp file so readers never see half a file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid file path: {}", path.display()))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, content.as_bytes())
        .map_err(|e| anyhow::anyhow!("write {}: {e}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|e| anyhow::anyhow!("persist {}: {e}", path.display()))?;
    Ok(())
}

pub(crate) fn read_text(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))
}

/// Rewrite `path` with `f`, keeping the file untouched when nothing changes.
pub(crate) fn rewrite(path: &Path, f: impl FnOnce(&str) -> String) -> anyhow::Result<()> {
    let before = read_text(path)?;
    let after = f(&before);
    if after != before {
        write_atomic(path, &after)?;
    }
    Ok(())
}

/// Join lines back with a trailing newline.
pub(crate) fn render_lines(lines: &[String]) -> String {
    let mut rendered = lines.join("\n");
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    rendered
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn staged(os: OsFamily) -> (tempfile::TempDir, LaunchContext, WorkDir) {
        let tmp = tempfile::tempdir().unwrap();
        let files = fake_distribution(tmp.path(), os);
        let ctx = context(files, os, "3.11.6").with_java_major(8);
        let work = WorkDir::stage(&ctx.files, &tmp.path().join("work")).unwrap();
        (tmp, ctx, work)
    }

    #[test]
    fn stage_copies_conf_and_leaves_distribution_alone() {
        let (tmp, ctx, work) = staged(OsFamily::Linux);
        assert!(work.config_file().is_file());
        assert!(work.jvm_options_file().is_some());
        assert!(work.env_script(OsFamily::Linux).is_some());
        assert!(work.env_script(OsFamily::Windows).is_none());
        assert!(work.data_root().join("commitlog").is_dir());

        let mut alloc = PortAllocator::new();
        let mut staging = Staging {
            ctx: &ctx,
            work: &work,
            ports: PortAssignment::from_config(&ctx.config),
            allocator: &mut alloc,
        };
        Pipeline::standard(false).run(&mut staging).unwrap();

        let shared = std::fs::read_to_string(ctx.files.conf_file(CONFIG_FILE)).unwrap();
        assert_eq!(shared, YAML);
        drop(tmp);
    }

    #[test]
    fn pipeline_order_is_fixed() {
        assert_eq!(
            Pipeline::standard(true).step_names(),
            vec!["main-config", "jvm-options", "java-compat", "numa", "random-ports"]
        );
    }

    #[test]
    fn pipeline_is_deterministic() {
        let (_tmp, ctx, _) = staged(OsFamily::Linux);
        let run = |dir: &str| {
            let work = WorkDir::stage(&ctx.files, &ctx.files.home.join(dir)).unwrap();
            let mut alloc = PortAllocator::new();
            let mut staging = Staging {
                ctx: &ctx,
                work: &work,
                ports: PortAssignment::from_config(&ctx.config),
                allocator: &mut alloc,
            };
            Pipeline::standard(false).run(&mut staging).unwrap();
            (
                std::fs::read_to_string(work.jvm_options_file().unwrap()).unwrap(),
                std::fs::read_to_string(work.env_script(OsFamily::Linux).unwrap()).unwrap(),
            )
        };
        assert_eq!(run("a"), run("b"));
    }

    #[test]
    fn missing_config_file_aborts_with_step_name() {
        let (_tmp, ctx, work) = staged(OsFamily::Linux);
        std::fs::remove_file(work.config_file()).unwrap();

        let mut alloc = PortAllocator::new();
        let mut staging = Staging {
            ctx: &ctx,
            work: &work,
            ports: PortAssignment::from_config(&ctx.config),
            allocator: &mut alloc,
        };
        let err = Pipeline::standard(false).run(&mut staging).unwrap_err();
        match err {
            StartError::Configuration { step, .. } => assert_eq!(step, "main-config"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
