use std::path::{Path, PathBuf};

use anyhow::Context;

pub(crate) fn parse_java_major_from_version_line(first_line: &str) -> anyhow::Result<u32> {
    // Typical formats:
    // - openjdk version "21.0.2" 2024-01-16
    // - java version "1.8.0_402"
    // Some builds omit quotes:
    // - openjdk 21.0.2 2024-01-16

    let ver = if let Some(quoted) = first_line.split('"').nth(1) {
        quoted
    } else {
        // The version token precedes the build date, so the first digit-led token wins.
        first_line
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| anyhow::anyhow!("failed to parse java version output: {first_line}"))?
    };

    let parse_leading_u32 = |s: &str| -> anyhow::Result<u32> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if end == 0 {
            anyhow::bail!("failed to parse java major from: {ver}");
        }
        s[..end]
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("failed to parse java major from: {ver}"))
    };

    let major = if ver.starts_with("1.") {
        let second = ver.split('.').nth(1).unwrap_or("");
        parse_leading_u32(second)?
    } else {
        let first = ver.split('.').next().unwrap_or("");
        parse_leading_u32(first)?
    };

    Ok(major)
}

/// `java` binary under `java_home`, then `$JAVA_HOME`, then whatever is on PATH.
pub(crate) fn java_binary(java_home: Option<&Path>) -> PathBuf {
    let exe = if cfg!(windows) { "java.exe" } else { "java" };
    java_home
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("JAVA_HOME").map(PathBuf::from))
        .map(|home| home.join("bin").join(exe))
        .unwrap_or_else(|| PathBuf::from(exe))
}

pub(crate) async fn detect_java_major(java_home: Option<&Path>) -> anyhow::Result<u32> {
    let java = java_binary(java_home);
    let out = tokio::process::Command::new(&java)
        .arg("-version")
        .output()
        .await
        .with_context(|| format!("run `{} -version`", java.display()))?;
    let text = String::from_utf8_lossy(&out.stderr);
    let first = text.lines().next().unwrap_or_default();

    parse_java_major_from_version_line(first)
}
