use std::{
    collections::BTreeMap,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use cradle_launch::{LaunchId, PortAssignment, Version};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// Record of one launch, written as `run.json` into its work directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub launch_id: LaunchId,
    pub version: String,
    pub started_at_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub argv: Vec<String>,
    pub cwd: String,
    pub ports: PortAssignment,
    pub env: BTreeMap<String, String>,
}

impl RunInfo {
    pub fn new(
        launch_id: LaunchId,
        version: Version,
        argv: Vec<String>,
        cwd: &Path,
        ports: PortAssignment,
        env: BTreeMap<String, String>,
    ) -> Self {
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            launch_id,
            version: version.to_string(),
            started_at_unix_ms,
            pid: None,
            argv,
            cwd: cwd.display().to_string(),
            ports,
            env: safe_env(env),
        }
    }
}

/// Drop anything that looks like a secret and shorten very long values.
fn safe_env(env: BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.into_iter()
        .map(|(k, v)| {
            let upper = k.to_ascii_uppercase();
            let v = if ["PASSWORD", "SECRET", "TOKEN"].iter().any(|s| upper.contains(s)) {
                "<redacted>".to_string()
            } else if v.len() > 512 {
                let cut = (0..=512).rev().find(|i| v.is_char_boundary(*i)).unwrap_or(0);
                format!("{}…(truncated)", &v[..cut])
            } else {
                v
            };
            (k, v)
        })
        .collect()
}

pub async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create work dir")?;
    let path = dir.join("run.json");
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run.json.tmp")?;
    f.write_all(&data).await.context("write run.json.tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cradle_launch::Config;

    use super::*;

    #[tokio::test]
    async fn writes_redacted_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("CASSANDRA_CONF".to_string(), "/w/conf".to_string());
        env.insert("KEYSTORE_PASSWORD".to_string(), "hunter2".to_string());
        let mut info = RunInfo::new(
            LaunchId("l-1".to_string()),
            "4.0.11".parse().unwrap(),
            vec!["bin/cassandra".to_string(), "-f".to_string()],
            tmp.path(),
            PortAssignment::from_config(&Config::default()),
            env,
        );
        info.pid = Some(42);

        write_run_json(tmp.path(), &info).await.unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("run.json")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["launch_id"], "l-1");
        assert_eq!(v["version"], "4.0.11");
        assert_eq!(v["pid"], 42);
        assert_eq!(v["ports"]["native_transport"], 9042);
        assert_eq!(v["env"]["CASSANDRA_CONF"], "/w/conf");
        assert_eq!(v["env"]["KEYSTORE_PASSWORD"], "<redacted>");
        assert!(!tmp.path().join("run.json.tmp").exists());
    }

    #[test]
    fn long_values_are_truncated() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "x".repeat(2000));
        let out = safe_env(env);
        assert!(out["PATH"].ends_with("…(truncated)"));
        assert!(out["PATH"].len() < 600);
    }
}
