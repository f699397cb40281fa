//! Configuration Types

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    pub forward: ForwardSpec,
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

/// The forwarding triple shared read-only by every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Listening socket configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub reuse_address: bool,
    pub backlog: u32,
}

/// Per-session relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_size: usize,
    pub connect_timeout: Option<Duration>,
    /// How long a chunk already read may keep writing once the session ends
    pub drain_timeout: Duration,
    pub nodelay: bool,
}

impl ForwardSpec {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// `host:port` of the remote target, as handed to the resolver
    pub fn target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reuse_address: true,
            backlog: 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            connect_timeout: None,
            drain_timeout: Duration::from_secs(1),
            nodelay: true,
        }
    }
}
