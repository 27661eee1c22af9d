use std::collections::HashSet;

use tracing::debug;

use super::jvm_options::{apply_jvm_options, flag_name};
use super::{FileCustomizer, Staging, render_lines, rewrite};
use cradle_launch::JvmOptionsMode;

/// Options the JDK 9+ launcher rejects outright (CMS, ParNew, legacy GC logging).
const REMOVED_JVM_FLAGS: &[&str] = &[
    "-XX:UseParNewGC",
    "-XX:UseConcMarkSweepGC",
    "-XX:CMSParallelRemarkEnabled",
    "-XX:CMSInitiatingOccupancyFraction",
    "-XX:UseCMSInitiatingOccupancyOnly",
    "-XX:CMSWaitDuration",
    "-XX:CMSParallelInitialMarkEnabled",
    "-XX:CMSEdenChunksRecordAlways",
    "-XX:CMSClassUnloadingEnabled",
    "-XX:ThreadPriorityPolicy",
    "-XX:UseBiasedLocking",
    "-XX:PrintGCDetails",
    "-XX:PrintGCDateStamps",
    "-XX:PrintHeapAtGC",
    "-XX:PrintTenuringDistribution",
    "-XX:PrintGCApplicationStoppedTime",
    "-XX:PrintPromotionFailure",
    "-XX:UseGCLogFileRotation",
    "-XX:NumberOfGCLogFiles",
    "-XX:GCLogFileSize",
];

const ADDED_JVM_OPTIONS: &[&str] = &[
    "-XX:+IgnoreUnrecognizedVMOptions",
    "-Djdk.attach.allowAttachSelf=true",
];

/// Env script statements that break on newer JDKs. Matching lines become no-ops.
const NEUTRALIZED_ENV_FRAGMENTS: &[&str] = &[
    "-Xloggc",
    "ThreadPriorityPolicy",
    "PrintGCDateStamps",
    "UseGCLogFileRotation",
    "NumberOfGCLogFiles",
    "GCLogFileSize",
];

/// Keeps older distributions bootable on a JVM newer than they were built for.
pub struct JavaCompatCustomizer;

impl FileCustomizer for JavaCompatCustomizer {
    fn name(&self) -> &'static str {
        "java-compat"
    }

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()> {
        let dist = &staging.ctx.distribution;
        let Some(java) = staging.ctx.executable.java_major else {
            debug!(launch = %staging.ctx.id, "java version unknown; skipping compatibility rewrite");
            return Ok(());
        };
        let target = dist.version.target_java_major();
        if java <= target {
            return Ok(());
        }
        debug!(launch = %staging.ctx.id, java, target, "rewriting for newer java");

        if let Some(path) = staging.work.jvm_options_file() {
            rewrite(&path, strip_removed_flags)?;
        }
        if let Some(script) = staging.work.env_script(dist.os) {
            rewrite(&script, neutralize_env_script)?;
        }
        Ok(())
    }
}

pub(crate) fn strip_removed_flags(content: &str) -> String {
    let removed: HashSet<&str> = REMOVED_JVM_FLAGS.iter().copied().collect();
    let kept: Vec<String> = content
        .lines()
        .filter(|l| {
            let t = l.trim();
            t.is_empty() || t.starts_with('#') || !removed.contains(flag_name(t).as_str())
        })
        .map(str::to_string)
        .collect();
    let added: Vec<String> = ADDED_JVM_OPTIONS.iter().map(|s| s.to_string()).collect();
    apply_jvm_options(&render_lines(&kept), &added, JvmOptionsMode::Add)
}

pub(crate) fn neutralize_env_script(content: &str) -> String {
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let hit = !trimmed.starts_with('#')
                && NEUTRALIZED_ENV_FRAGMENTS.iter().any(|f| trimmed.contains(f));
            if hit {
                // `:` keeps if/fi blocks syntactically non-empty.
                let indent = &line[..line.len() - trimmed.len()];
                format!("{indent}: # {trimmed}")
            } else {
                line.to_string()
            }
        })
        .collect();
    render_lines(&lines)
}
