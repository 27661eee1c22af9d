use std::{collections::HashSet, io::ErrorKind, net::TcpListener};

use anyhow::Context;

const MAX_DUPLICATE_RETRIES: usize = 32;

/// Ask the OS for an ephemeral port. The listener is closed before returning,
/// so the port is only likely (not guaranteed) to still be free.
pub fn allocate_tcp_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).context("bind ephemeral port")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

#[derive(Debug, thiserror::Error)]
pub enum PortCheckError {
    #[error("port already in use: {0}")]
    InUse(u16),
    #[error("bind port {port}: {source}")]
    Other {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Validate that a caller-fixed port can currently be bound.
pub fn ensure_available(port: u16) -> Result<(), PortCheckError> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(PortCheckError::InUse(port)),
        Err(source) => Err(PortCheckError::Other { port, source }),
    }
}

/// Hands out ephemeral ports for one launch, never the same one twice.
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> anyhow::Result<u16> {
        for _ in 0..MAX_DUPLICATE_RETRIES {
            let port = allocate_tcp_port()?;
            if self.issued.insert(port) {
                return Ok(port);
            }
        }
        anyhow::bail!("OS kept returning already issued ports ({} tries)", MAX_DUPLICATE_RETRIES)
    }

    /// Record a port that was fixed by the caller so it is never handed out.
    pub fn reserve(&mut self, port: u16) {
        if port != 0 {
            self.issued.insert(port);
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}
