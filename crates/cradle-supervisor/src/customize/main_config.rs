use std::collections::{BTreeMap, BTreeSet};

use super::{FileCustomizer, Staging, render_lines, rewrite};

/// Writes ports, transport switches, addresses and data dirs into `cassandra.yaml`.
pub struct MainConfigCustomizer;

impl FileCustomizer for MainConfigCustomizer {
    fn name(&self) -> &'static str {
        "main-config"
    }

    fn customize(&self, staging: &mut Staging<'_>) -> anyhow::Result<()> {
        let config = &staging.ctx.config;
        let version = staging.ctx.distribution.version;
        let ports = staging.ports;
        let data = staging.work.data_root();

        let mut values = BTreeMap::<String, String>::new();
        for (k, v) in &config.settings {
            values.insert(k.clone(), v.clone());
        }

        values.insert("cluster_name".into(), quote(&config.cluster_name));
        values.insert("listen_address".into(), config.address.to_string());
        values.insert("rpc_address".into(), config.address.to_string());
        values.insert(
            "start_native_transport".into(),
            config.start_native_transport.to_string(),
        );
        values.insert(
            "native_transport_port".into(),
            ports.native_transport.to_string(),
        );
        if let Some(ssl) = ports.native_transport_ssl {
            values.insert("native_transport_port_ssl".into(), ssl.to_string());
        }
        values.insert("storage_port".into(), ports.storage.to_string());
        values.insert("ssl_storage_port".into(), ports.ssl_storage.to_string());
        // Thrift is gone from 4.x and unknown keys are rejected there.
        if version.major < 4 {
            values.insert("start_rpc".into(), config.start_rpc.to_string());
            values.insert("rpc_port".into(), ports.rpc.to_string());
        }

        values.insert(
            "data_file_directories".into(),
            format!("[{}]", quote(&data.join("data").to_string_lossy())),
        );
        values.insert(
            "commitlog_directory".into(),
            quote(&data.join("commitlog").to_string_lossy()),
        );
        values.insert(
            "saved_caches_directory".into(),
            quote(&data.join("saved_caches").to_string_lossy()),
        );
        if version.major >= 3 {
            values.insert(
                "hints_directory".into(),
                quote(&data.join("hints").to_string_lossy()),
            );
        }

        rewrite(&staging.work.config_file(), |content| {
            upsert_yaml_keys(content, &values)
        })
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn top_level_key(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(|c: char| c.is_whitespace() || c == '#' || c == '-') {
        return None;
    }
    let (key, rest) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, rest.trim()))
}

/// Set top-level `key: value` pairs, replacing existing keys (and their nested
/// block, if any) in place and appending missing ones in key order.
pub fn upsert_yaml_keys(content: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = Vec::<String>::new();
    let mut seen = BTreeSet::<&str>::new();
    let mut skipping_block = false;

    for line in content.lines() {
        if skipping_block {
            if line.starts_with(|c: char| c == ' ' || c == '\t' || c == '-') {
                continue;
            }
            skipping_block = false;
        }

        if let Some((key, old_value)) = top_level_key(line)
            && let Some((k, new_value)) = values.get_key_value(key)
        {
            out.push(format!("{k}: {new_value}"));
            seen.insert(k.as_str());
            skipping_block = old_value.is_empty();
            continue;
        }

        out.push(line.to_string());
    }

    for (key, value) in values {
        if !seen.contains(key.as_str()) {
            out.push(format!("{key}: {value}"));
        }
    }

    render_lines(&out)
}
