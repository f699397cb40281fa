//! Listener Implementation

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, ForwardSpec};
use crate::relay::RelayEngine;
use crate::Result;

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts inbound connections and runs one detached relay task per connection
pub struct Listener {
    listener: TcpListener,
    spec: Arc<ForwardSpec>,
    relay: Arc<RelayEngine>,
}

impl Listener {
    /// Bind the listening socket. Bind and listen failures are returned here,
    /// before any connection is accepted.
    pub async fn bind(config: &Config) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.server.bind_ip, config.forward.local_port);

        info!("Binding TCP listener to {}", bind_addr);
        let socket = match bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .context("Failed to create listening socket")?;

        // Windows SO_REUSEADDR lets a second process steal a bound port.
        #[cfg(unix)]
        socket.set_reuseaddr(config.server.reuse_address)
            .context("Failed to enable address reuse")?;

        socket.bind(bind_addr)
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let listener = socket.listen(config.server.backlog)
            .with_context(|| format!("Failed to listen on {}", bind_addr))?;

        info!("Successfully bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            spec: Arc::new(config.forward.clone()),
            relay: Arc::new(RelayEngine::from_config(&config.relay)),
        })
    }

    /// Bind and accept connections forever
    pub async fn start(config: &Config) -> Result<()> {
        Self::bind(config).await?.serve().await
    }

    /// Get the bound address, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
            .context("Failed to read listener address")
    }

    pub fn forward_spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Accept connections until the process is terminated
    pub async fn serve(self) -> Result<()> {
        self.accept_connections(std::future::pending()).await
    }

    /// Accept connections until a shutdown signal arrives. Sessions already
    /// running are left to finish on their own.
    pub async fn serve_with_shutdown(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.accept_connections(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
    }

    async fn accept_connections<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Forwarding {} -> {}", self.local_addr()?, self.spec.target());

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.spawn_session(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let spec = Arc::clone(&self.spec);
        let relay = Arc::clone(&self.relay);
        let span = info_span!("session", peer = %addr);

        // Detached: nothing joins session tasks, so they never hold up exit.
        tokio::spawn(
            async move {
                debug!("Accepted connection from {}", addr);
                match relay.run(stream, &spec.remote_host, spec.remote_port).await {
                    Ok(stats) => {
                        debug!("Session {} closed ({:?})", stats.session_id, stats.end);
                    }
                    Err(e) => {
                        warn!("Session from {} ended with error: {:#}", addr, e);
                    }
                }
            }
            .instrument(span),
        );
    }
}
