//! Server address with connection affinity.
//!
//! The configured host name may resolve to several machines (round-robin
//! DNS, load balancers). After the first successful login the address is
//! pinned to the peer of that connection and every later connection of
//! the session targets the same endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;

use tokio::net::lookup_host;
use tracing::debug;

use crate::error::{FtpError, Result};

/// Default control port.
pub const DEFAULT_PORT: u16 = 21;

/// Host and port of the server a session talks to.
#[derive(Debug)]
pub struct ServerAddress {
    host: String,
    port: u16,
    pinned: OnceLock<SocketAddr>,
}

impl ServerAddress {
    /// Address that still needs name resolution.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            pinned: OnceLock::new(),
        }
    }

    /// Configured host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pin the address to `addr`. Only the first call has an effect;
    /// returns whether it did.
    pub fn pin(&self, addr: SocketAddr) -> bool {
        let pinned = self.pinned.set(addr).is_ok();
        if pinned {
            debug!(host = %self.host, %addr, "server address pinned");
        }
        pinned
    }

    /// The pinned socket address, if any.
    pub fn pinned(&self) -> Option<SocketAddr> {
        self.pinned.get().copied()
    }

    /// Socket addresses to try, in order.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Some(addr) = self.pinned() {
            return Ok(vec![addr]);
        }
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port)).await?.collect();
        if addrs.is_empty() {
            return Err(FtpError::ConnectionRefused {
                addr: self.to_string(),
            });
        }
        Ok(addrs)
    }

    /// Human readable name: the host, plus the port when it is not 21.
    pub fn display_name(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
