//! Configuration Manager

use super::{Config, ForwardSpec, RelayConfig, ServerConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::net::IpAddr;
use std::time::Duration;

/// Largest accepted relay chunk size
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Builds and validates configuration
pub struct ConfigManager;

impl ConfigManager {
    /// Build a configuration for `spec` with default server and relay settings
    pub fn from_forward_spec(spec: ForwardSpec) -> Result<Config> {
        let config = Config {
            forward: spec,
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_forward_spec()
            .with_context(|| "Forward configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        Ok(())
    }

    fn validate_forward_spec(&self) -> Result<()> {
        let host = self.forward.remote_host.trim();
        if host.is_empty() {
            bail!("remote_host must not be empty");
        }

        if host.len() > 253 {
            bail!("remote_host cannot exceed 253 characters");
        }

        if self.forward.remote_port == 0 {
            bail!("remote_port must be greater than 0");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.relay.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.connect_timeout == Some(Duration::ZERO) {
            bail!("connect_timeout must be greater than 0 when set");
        }

        if self.relay.drain_timeout.is_zero() {
            bail!("drain_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind_ip: Option<IpAddr>,
        buffer_size: Option<usize>,
        connect_timeout: Option<Duration>,
        drain_timeout: Option<Duration>,
        no_reuse_address: bool,
    ) {
        if let Some(ip) = bind_ip {
            self.server.bind_ip = ip;
            tracing::info!("CLI override: bind address set to {}", ip);
        }

        if let Some(buffer_size) = buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(timeout) = connect_timeout {
            self.relay.connect_timeout = Some(timeout);
            tracing::info!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(timeout) = drain_timeout {
            self.relay.drain_timeout = timeout;
            tracing::info!("CLI override: drain timeout set to {:?}", timeout);
        }

        if no_reuse_address {
            self.server.reuse_address = false;
            tracing::info!("CLI override: address reuse disabled");
        }
    }
}
