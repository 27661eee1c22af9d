use std::collections::HashSet;

use cradle_launch::JvmOptionsMode;
use tracing::debug;

use super::{FileCustomizer, Staging, render_lines, rewrite};

/// Applies the caller's JVM options and the launch's system properties.
///
/// Distributions without an options file (2.x) get both on the command line instead.
pub struct JvmOptionsCustomizer;

impl FileCustomizer for JvmOptionsCustomizer {
    fn name(&self) -> &'static str {
        "jvm-options"
    }

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()> {
        let exe = &staging.ctx.executable;
        let props = staging.system_properties();

        match staging.work.jvm_options_file() {
            Some(path) => rewrite(&path, |content| {
                let content = apply_jvm_options(content, &exe.jvm_options, exe.jvm_options_mode);
                apply_jvm_options(&content, &props, JvmOptionsMode::Replace)
            })?,
            None => debug!(launch = %staging.ctx.id, "no jvm options file; options go on the command line"),
        }

        if let Some(script) = staging.work.env_script(staging.ctx.distribution.os) {
            let jmx = staging.ports.jmx;
            rewrite(&script, |content| set_env_jmx_port(content, jmx))?;
        }
        Ok(())
    }
}

/// Name an option is identified by when replacing: `-Dkey=v` → `-Dkey`,
/// `-XX:+Flag` / `-XX:Flag=v` → `-XX:Flag`, `-Xmx4G` → `-Xmx`.
pub fn flag_name(option: &str) -> String {
    let opt = option.trim();
    if let Some(rest) = opt.strip_prefix("-XX:") {
        let rest = rest.trim_start_matches(['+', '-']);
        let name = rest.split('=').next().unwrap_or(rest);
        return format!("-XX:{name}");
    }
    for sized in ["-Xms", "-Xmx", "-Xmn", "-Xss"] {
        if opt.starts_with(sized) {
            return sized.to_string();
        }
    }
    opt.split_once('=')
        .map(|(k, _)| k)
        .unwrap_or(opt)
        .to_string()
}

fn is_option_line(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty() && !t.starts_with('#')
}

/// Apply `options` to a JVM options file. `Add` only appends options not yet
/// present; `Replace` first drops every option sharing a flag name.
pub fn apply_jvm_options(content: &str, options: &[String], mode: JvmOptionsMode) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    if mode == JvmOptionsMode::Replace {
        let names: HashSet<String> = options.iter().map(|o| flag_name(o)).collect();
        lines.retain(|l| !is_option_line(l) || !names.contains(&flag_name(l)));
    }

    for opt in options {
        let opt = opt.trim();
        if opt.is_empty() {
            continue;
        }
        if !lines.iter().any(|l| l.trim() == opt) {
            lines.push(opt.to_string());
        }
    }

    render_lines(&lines)
}

/// Point the env script's `JMX_PORT=` assignment at `port`.
pub(crate) fn set_env_jmx_port(content: &str, port: u16) -> String {
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("JMX_PORT=") {
                let indent = &line[..line.len() - trimmed.len()];
                format!("{indent}JMX_PORT=\"{port}\"")
            } else {
                line.to_string()
            }
        })
        .collect();
    render_lines(&lines)
}
