use std::path::Path;

use cradle_launch::{CpuWidth, Distribution, OsFamily};

use super::{FileCustomizer, Staging, render_lines, rewrite};
use super::jvm_options::flag_name;

const NUMA_FLAG: &str = "-XX:UseNUMA";

/// Whether the host can honour NUMA-aware launches of `dist`.
///
/// Only 64-bit Linux builds on hosts that expose NUMA nodes qualify.
pub fn numa_capable(dist: &Distribution) -> bool {
    dist.os == OsFamily::Linux
        && dist.cpu == CpuWidth::Bits64
        && OsFamily::current() == OsFamily::Linux
        && Path::new("/sys/devices/system/node/node0").exists()
}

/// Strips `-XX:+UseNUMA` when the launch is not NUMA capable.
pub struct NumaCustomizer {
    capable: bool,
}

impl NumaCustomizer {
    pub fn new(capable: bool) -> Self {
        Self { capable }
    }
}

impl FileCustomizer for NumaCustomizer {
    fn name(&self) -> &'static str {
        "numa"
    }

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()> {
        if self.capable {
            return Ok(());
        }
        let Some(path) = staging.work.jvm_options_file() else {
            return Ok(());
        };
        rewrite(&path, |content| {
            let kept: Vec<String> = content
                .lines()
                .filter(|l| {
                    let t = l.trim();
                    t.is_empty() || t.starts_with('#') || flag_name(t) != NUMA_FLAG
                })
                .map(str::to_string)
                .collect();
            render_lines(&kept)
        })
    }
}
