//! Stand-in node for process tests.
//!
//! Reads `$CASSANDRA_CONF/cassandra.yaml`, binds the storage port and the
//! client ports it enables, and prints the lines a real node prints. A port
//! that cannot be bound produces the node's fatal bind output and exit code 3.

use std::{
    collections::HashMap,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    path::PathBuf,
};

use anyhow::Context;

struct NodeConfig {
    address: IpAddr,
    storage_port: u16,
    native_transport: Option<u16>,
    rpc: Option<u16>,
}

fn parse_config(yaml: &str) -> anyhow::Result<NodeConfig> {
    let mut keys = HashMap::new();
    for line in yaml.lines() {
        if line.starts_with([' ', '\t', '#', '-']) {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            let v = v.trim().trim_matches(['\'', '"']);
            keys.insert(k.trim().to_string(), v.to_string());
        }
    }
    let port = |key: &str| -> anyhow::Result<u16> {
        keys.get(key)
            .with_context(|| format!("Missing required key {key}"))?
            .parse::<u16>()
            .with_context(|| format!("invalid {key}"))
    };
    let enabled = |key: &str| keys.get(key).is_some_and(|v| v == "true");

    let address = keys
        .get("listen_address")
        .and_then(|a| a.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    Ok(NodeConfig {
        address,
        storage_port: port("storage_port")?,
        native_transport: if enabled("start_native_transport") {
            Some(port("native_transport_port")?)
        } else {
            None
        },
        rpc: if enabled("start_rpc") {
            Some(port("rpc_port")?)
        } else {
            None
        },
    })
}

fn say(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn bind_or_die(address: IpAddr, port: u16) -> TcpListener {
    match TcpListener::bind(SocketAddr::new(address, port)) {
        Ok(l) => l,
        Err(e) => {
            say(&format!("ERROR Failed to bind port {port} on {address}."));
            say(&format!("java.net.BindException: Address already in use ({e})"));
            say("ERROR Exception encountered during startup");
            std::process::exit(3);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let conf = std::env::var_os("CASSANDRA_CONF")
        .map(PathBuf::from)
        .context("CASSANDRA_CONF is not set")?;
    let yaml = std::fs::read_to_string(conf.join("cassandra.yaml"))
        .with_context(|| format!("read {}", conf.display()))?;
    let config = match parse_config(&yaml) {
        Ok(c) => c,
        Err(e) => {
            say(&format!("ERROR org.apache.cassandra.exceptions.ConfigurationException: {e:#}"));
            std::process::exit(1);
        }
    };

    say("INFO  Loading settings from cassandra.yaml");
    let storage = bind_or_die(config.address, config.storage_port);
    say(&format!(
        "INFO  Starting Messaging Service on /{}:{}",
        config.address, config.storage_port
    ));

    let mut listeners = vec![storage];
    if let Some(port) = config.rpc {
        listeners.push(bind_or_die(config.address, port));
        say(&format!("INFO  Listening for thrift clients on /{}:{port}", config.address));
    }
    if let Some(port) = config.native_transport {
        listeners.push(bind_or_die(config.address, port));
        say(&format!(
            "INFO  Starting listening for CQL clients on /{}:{port} (unencrypted)...",
            config.address
        ));
    }

    // Serve the last bound listener until killed; the rest just stay bound.
    let Some(serving) = listeners.pop() else {
        return Ok(());
    };
    for conn in serving.incoming() {
        drop(conn);
    }
    Ok(())
}
