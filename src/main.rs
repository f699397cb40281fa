//! PortRelay - local TCP port forwarder
//!
//! Listens on a local port and relays every accepted connection to a fixed
//! remote host and port.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portrelay::{config::ConfigManager, ForwardSpec, Listener, ShutdownCoordinator};

/// CLI arguments for PortRelay
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "PortRelay - forward a local TCP port to a remote host")]
#[command(version)]
#[command(long_about = "
PortRelay - forward a local TCP port to a remote host

Every connection accepted on the local port opens a new connection to
ADDR:REMOTE and bytes are relayed unmodified in both directions until
either side closes.

Logging can be tuned with RUST_LOG, which takes precedence over --log-level.
")]
pub struct CliArgs {
    /// Local TCP port to listen on
    #[arg(short, long, help = "Local TCP port to listen on")]
    pub local: u16,

    /// Remote host to forward to
    #[arg(short, long, help = "Remote host to forward to")]
    pub addr: String,

    /// Remote TCP port to forward to
    #[arg(short, long, help = "Remote TCP port to forward to")]
    pub remote: u16,

    /// Local address to bind (defaults to all interfaces)
    #[arg(long, help = "Local address to bind (e.g., 127.0.0.1)")]
    pub bind: Option<IpAddr>,

    /// Relay buffer size in bytes
    #[arg(long, help = "Relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Timeout for dialing the remote host
    #[arg(long, value_parser = humantime::parse_duration, help = "Dial timeout (e.g., 5s, 500ms)")]
    pub connect_timeout: Option<Duration>,

    /// Grace period for delivering an in-flight chunk once a session ends
    #[arg(long, value_parser = humantime::parse_duration, help = "Drain timeout after one side closes (e.g., 1s)")]
    pub drain_timeout: Option<Duration>,

    /// Do not set SO_REUSEADDR on the listening socket
    #[arg(long, help = "Disable address reuse on the listening socket")]
    pub no_reuse_address: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("addr={:?}, local={}, remote={}", args.addr, args.local, args.remote);

    let mut config = ConfigManager::from_forward_spec(ForwardSpec::new(
        args.local,
        args.addr.clone(),
        args.remote,
    ))?;

    config.merge_with_cli_args(
        args.bind,
        args.buffer_size,
        args.connect_timeout,
        args.drain_timeout,
        args.no_reuse_address,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    let listener = Listener::bind(&config).await?;

    let shutdown_coordinator = ShutdownCoordinator::new();
    let server_handle = tokio::spawn(listener.serve_with_shutdown(shutdown_coordinator.subscribe()));

    info!("Press Ctrl+C or send SIGTERM/SIGINT to stop");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    match server_handle.await {
        Ok(result) => result?,
        Err(e) if !e.is_cancelled() => error!("Server task failed: {}", e),
        Err(_) => {}
    }

    info!("Stopped");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
