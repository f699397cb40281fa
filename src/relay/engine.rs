//! Relay Engine

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::{anyhow, Context};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::Result;
use super::session::{ConnectionStats, RelaySession, SessionEnd};

/// How one direction of a session stopped copying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    /// The reading side returned a zero-length read
    Eof,
    /// The opposite direction ended first
    Stopped,
}

/// Dials the target for an accepted connection and relays bytes both ways
#[derive(Debug, Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    connect_timeout: Option<Duration>,
    drain_timeout: Duration,
    nodelay: bool,
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayEngine {
    /// Create a new relay engine with default settings
    pub fn new() -> Self {
        Self::from_config(&RelayConfig::default())
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            connect_timeout: config.connect_timeout,
            drain_timeout: config.drain_timeout,
            nodelay: config.nodelay,
        }
    }

    /// Run one session: dial `remote_host:remote_port`, relay until either
    /// side ends, then close both endpoints.
    ///
    /// Every exit path closes `inbound`, including a failed dial.
    pub async fn run(
        &self,
        mut inbound: TcpStream,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ConnectionStats> {
        let client_addr = inbound.peer_addr()
            .context("Failed to get client address")?;

        let (target, target_addr) = match self.connect_to_target(remote_host, remote_port).await {
            Ok(connected) => connected,
            Err(e) => {
                close_quietly(&mut inbound).await;
                return Err(e);
            }
        };

        if self.nodelay {
            for stream in [&inbound, &target] {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
            }
        }

        let session = RelaySession::new(client_addr, target_addr);
        info!("Started relay session {} from {} to {}",
              session.session_id, client_addr, target_addr);

        self.relay_data(&session, inbound, target).await
    }

    /// Establish connection to the target, trying each resolved address in order
    pub async fn connect_to_target(&self, host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
        debug!("Attempting to connect to target: {}:{}", host, port);

        let socket_addrs = self.resolve_target_address(host, port).await
            .context("Failed to resolve target address")?;

        let mut last_error = None;
        for addr in socket_addrs {
            match self.bounded(TcpStream::connect(addr)).await {
                Ok(stream) => {
                    debug!("Connected to target: {}", addr);
                    return Ok((stream, addr));
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let error_msg = format!("Failed to connect to target {}:{}", host, port);
        match last_error {
            Some(e) => Err(anyhow!("{}: {}", error_msg, e)),
            None => Err(anyhow!("{}: No addresses resolved", error_msg)),
        }
    }

    async fn resolve_target_address(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self.bounded(lookup_host((host, port))).await
            .with_context(|| format!("DNS resolution failed for {}", host))?
            .collect();

        if addrs.is_empty() {
            return Err(anyhow!("DNS resolution returned no addresses for {}", host));
        }

        debug!("Resolved {} to {} addresses", host, addrs.len());
        Ok(addrs)
    }

    /// Apply the optional connect timeout to a dial step
    async fn bounded<F, T>(&self, fut: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.connect_timeout {
            Some(limit) => timeout(limit, fut).await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))?,
            None => fut.await,
        }
    }

    /// Relay data bidirectionally between client and target
    pub async fn relay_data(
        &self,
        session: &RelaySession,
        mut client: TcpStream,
        mut target: TcpStream,
    ) -> Result<ConnectionStats> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let result = {
            let (client_read, client_write) = client.split();
            let (target_read, target_write) = target.split();

            let (up, down) = tokio::join!(
                pump(client_read, target_write, self.buffer_size, self.drain_timeout,
                     &session.bytes_up, &stop_tx, stop_rx.clone()),
                pump(target_read, client_write, self.buffer_size, self.drain_timeout,
                     &session.bytes_down, &stop_tx, stop_rx),
            );
            settle(up, down)
        };

        close_quietly(&mut client).await;
        close_quietly(&mut target).await;

        match result {
            Ok(end) => {
                session.log_stats(Some(end));
                Ok(session.to_stats(end))
            }
            Err(e) => {
                session.log_stats(None);
                Err(e.context(format!("Relay session {} failed", session.session_id)))
            }
        }
    }
}

/// Copy one direction, then raise the stop flag whatever the outcome
async fn pump<R, W>(
    reader: R,
    writer: W,
    buffer_size: usize,
    drain_timeout: Duration,
    transferred: &AtomicU64,
    stop_tx: &watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
) -> io::Result<PumpOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = copy_until_stopped(reader, writer, buffer_size, drain_timeout, transferred, stop_rx).await;
    stop_tx.send_replace(true);
    outcome
}

async fn copy_until_stopped<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    drain_timeout: Duration,
    transferred: &AtomicU64,
    mut stop_rx: watch::Receiver<bool>,
) -> io::Result<PumpOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);

    loop {
        if *stop_rx.borrow_and_update() {
            return Ok(PumpOutcome::Stopped);
        }

        buf.clear();
        let n = tokio::select! {
            biased;
            _ = stop_rx.changed() => return Ok(PumpOutcome::Stopped),
            read = reader.read_buf(&mut buf) => read?,
        };

        if n == 0 {
            return Ok(PumpOutcome::Eof);
        }

        // A chunk that was read keeps being written after the other direction
        // stops, but only for `drain_timeout`; a peer that is not reading
        // cannot hold the session open.
        let write = writer.write_all(&buf[..n]);
        tokio::pin!(write);
        tokio::select! {
            biased;
            written = &mut write => written?,
            _ = stop_rx.changed() => match timeout(drain_timeout, &mut write).await {
                Ok(written) => written?,
                Err(_) => {
                    debug!("Dropping {} undelivered bytes after drain timeout", n);
                    return Ok(PumpOutcome::Stopped);
                }
            },
        }
        transferred.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// An orderly EOF on either side wins over an error the other direction hit
/// while being torn down.
fn settle(up: io::Result<PumpOutcome>, down: io::Result<PumpOutcome>) -> Result<SessionEnd> {
    match (up, down) {
        (Ok(PumpOutcome::Eof), _) => Ok(SessionEnd::ClientClosed),
        (_, Ok(PumpOutcome::Eof)) => Ok(SessionEnd::TargetClosed),
        (Err(e), _) => Err(e).context("client -> target relay failed"),
        (_, Err(e)) => Err(e).context("target -> client relay failed"),
        (Ok(PumpOutcome::Stopped), Ok(PumpOutcome::Stopped)) => {
            Err(anyhow!("relay stopped without an end of stream"))
        }
    }
}

/// Best-effort shutdown; the socket itself closes when dropped
async fn close_quietly(stream: &mut TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!("Ignoring error while closing endpoint: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const DRAIN: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_pump_forwards_every_chunk_until_eof() {
        let reader = Builder::new().read(b"hello").read(b" world").build();
        let writer = Builder::new().write(b"hello").write(b" world").build();
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        let outcome = pump(reader, writer, 64, DRAIN, &counter, &stop_tx, stop_rx).await.unwrap();

        assert_eq!(outcome, PumpOutcome::Eof);
        assert_eq!(counter.load(Ordering::Relaxed), 11);
        assert!(*stop_tx.borrow());
    }

    #[tokio::test]
    async fn test_pump_stops_when_other_direction_ends() {
        // Holding the peer ends open keeps the read pending.
        let (_client, reader) = duplex(64);
        let (writer, _sink) = duplex(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        let (outcome, _) = tokio::join!(
            pump(reader, writer, 16, DRAIN, &counter, &stop_tx, stop_rx),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop_tx.send_replace(true);
            }
        );

        assert_eq!(outcome.unwrap(), PumpOutcome::Stopped);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_pump_write_error_raises_stop_flag() {
        let reader = Builder::new().read(b"data").build();
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        let err = pump(reader, writer, 64, DRAIN, &counter, &stop_tx, stop_rx).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert!(*stop_tx.borrow());
    }

    #[tokio::test]
    async fn test_small_buffer_splits_but_preserves_order() {
        let (mut source, reader) = duplex(256);
        let (writer, mut sink) = duplex(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        source.write_all(b"abcdefghijklmnopqrstuvwxyz").await.unwrap();
        drop(source);

        let outcome = pump(reader, writer, 4, DRAIN, &counter, &stop_tx, stop_rx).await.unwrap();
        assert_eq!(outcome, PumpOutcome::Eof);

        let mut received = Vec::new();
        sink.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(counter.load(Ordering::Relaxed), 26);
    }

    #[test]
    fn test_settle_reports_closing_side() {
        assert_eq!(
            settle(Ok(PumpOutcome::Eof), Ok(PumpOutcome::Stopped)).unwrap(),
            SessionEnd::ClientClosed
        );
        assert_eq!(
            settle(Ok(PumpOutcome::Stopped), Ok(PumpOutcome::Eof)).unwrap(),
            SessionEnd::TargetClosed
        );

        let err = settle(
            Ok(PumpOutcome::Stopped),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("target -> client"));
    }

    #[test]
    fn test_settle_prefers_eof_over_teardown_error() {
        assert_eq!(
            settle(Ok(PumpOutcome::Eof), Err(io::Error::from(io::ErrorKind::BrokenPipe))).unwrap(),
            SessionEnd::ClientClosed
        );
        assert_eq!(
            settle(Err(io::Error::from(io::ErrorKind::ConnectionReset)), Ok(PumpOutcome::Eof)).unwrap(),
            SessionEnd::TargetClosed
        );
    }

    #[tokio::test]
    async fn test_blocked_write_gives_up_after_drain_timeout() {
        let (mut source, reader) = duplex(1024);
        // Tiny pipe that nobody reads: the write stalls after 8 bytes.
        let (writer, _sink) = duplex(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        source.write_all(&[7u8; 256]).await.unwrap();

        let run = async {
            tokio::join!(
                pump(reader, writer, 256, Duration::from_millis(50), &counter, &stop_tx, stop_rx),
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    stop_tx.send_replace(true);
                }
            )
        };
        let (outcome, _) = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("a stalled write must not outlive the drain timeout");

        assert_eq!(outcome.unwrap(), PumpOutcome::Stopped);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_stalled_chunk_delivered_if_peer_reads_within_drain_window() {
        let (mut source, reader) = duplex(1024);
        let (writer, mut sink) = duplex(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let counter = AtomicU64::new(0);

        source.write_all(&[9u8; 256]).await.unwrap();

        let (outcome, received) = tokio::join!(
            pump(reader, writer, 256, DRAIN, &counter, &stop_tx, stop_rx),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop_tx.send_replace(true);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut received = vec![0u8; 256];
                sink.read_exact(&mut received).await.unwrap();
                received
            }
        );

        assert_eq!(outcome.unwrap(), PumpOutcome::Stopped);
        assert_eq!(received, vec![9u8; 256]);
        assert_eq!(counter.load(Ordering::Relaxed), 256);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_applied() {
        let engine = RelayEngine::from_config(&RelayConfig {
            connect_timeout: Some(Duration::from_millis(10)),
            ..RelayConfig::default()
        });

        let err = engine
            .bounded(std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
