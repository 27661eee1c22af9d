use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use cradle_launch::{Config, PortAssignment};
use tokio::net::TcpStream;

use crate::error::StartError;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Whether `config` enables any client transport worth probing.
pub fn is_enabled(config: &Config) -> bool {
    config.start_native_transport || config.start_rpc
}

/// Client ports of one launch and the host they listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: IpAddr,
    pub ports: Vec<u16>,
}

impl ProbeTarget {
    pub fn new(config: &Config, ports: &PortAssignment) -> Self {
        // A wildcard listen address is reached through loopback.
        let host = if config.address.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            config.address
        };
        Self {
            host,
            ports: ports.client_ports(config),
        }
    }

    async fn any_accepts(&self, per_attempt: Duration) -> bool {
        for port in &self.ports {
            let addr = SocketAddr::new(self.host, *port);
            if let Ok(Ok(s)) = tokio::time::timeout(per_attempt, TcpStream::connect(addr)).await {
                drop(s);
                return true;
            }
        }
        false
    }
}

/// Up to `attempts` rounds over every client port; true as soon as one accepts.
pub async fn is_connected(target: &ProbeTarget, attempts: u32, per_attempt: Duration) -> bool {
    if target.ports.is_empty() {
        return false;
    }
    for attempt in 0..attempts {
        if target.any_accepts(per_attempt).await {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
    false
}

/// Keep probing until a client port accepts or `total` elapses.
pub async fn await_ready(target: &ProbeTarget, total: Duration, per_attempt: Duration) -> bool {
    if target.ports.is_empty() {
        return false;
    }
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if target.any_accepts(per_attempt).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// [`is_connected`], reported as [`StartError::TransportUnreachable`] on failure.
pub async fn check_connection(
    target: &ProbeTarget,
    attempts: u32,
    per_attempt: Duration,
) -> Result<(), StartError> {
    if is_connected(target, attempts, per_attempt).await {
        Ok(())
    } else {
        Err(StartError::TransportUnreachable {
            ports: target.ports.clone(),
            attempts,
        })
    }
}
