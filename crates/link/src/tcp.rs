//! TCP mesh links for the wired backbone.
//!
//! Both ends exchange the same length-prefixed mesh frames as every other
//! transport. Before any frame flows, the client must present the link
//! password:
//!
//! ```text
//! client -> server:  b"QMESH1" || u16_be_pw_len || pw_bytes
//! server -> client:  one status byte (0 ok, 1 bad password, 2 bad handshake)
//! ```
//!
//! The handshake admits the connection and nothing more; it provides no
//! confidentiality for mesh content. The server keeps one admitted
//! connection at a time and continues accepting after a drop. A client whose
//! password is rejected stops rather than hammering the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qmesh_events::{EventBus, ShutdownSignal};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::conn::{backoff_wait, next_backoff, pump_frames, ConnEnd, PumpCtx};
use crate::error::{LinkError, LinkResult};
use crate::metrics::{LinkMetrics, LinkMetricsSnapshot};
use crate::{InboundFrame, Link};

/// Handshake magic preceding the password.
pub const HANDSHAKE_MAGIC: &[u8; 6] = b"QMESH1";

/// Status byte: connection admitted.
pub const HS_OK: u8 = 0x00;
/// Status byte: password mismatch.
pub const HS_BAD_PASSWORD: u8 = 0x01;
/// Status byte: malformed hello.
pub const HS_BAD_HANDSHAKE: u8 = 0x02;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const REJECT_PAUSE: Duration = Duration::from_millis(250);

/// Settings for an outbound TCP mesh connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// Peer host
    pub host: String,
    /// Peer port
    pub port: u16,
    /// Link password presented at admission
    pub password: String,
    /// Initial reconnect delay in seconds
    pub reconnect_backoff_base_s: f64,
    /// Reconnect delay cap in seconds
    pub reconnect_backoff_max_s: f64,
    /// Frames queued for transmission before drops begin
    pub tx_queue_size: usize,
}

/// Settings for the listening side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Password inbound clients must present
    pub password: String,
    /// Frames queued for transmission before drops begin
    pub tx_queue_size: usize,
}

/// Build the client's hello bytes.
pub fn client_hello(password: &str) -> LinkResult<Vec<u8>> {
    let pw = password.as_bytes();
    if pw.len() > u16::MAX as usize {
        return Err(LinkError::PasswordTooLong(pw.len()));
    }
    let mut hello = Vec::with_capacity(HANDSHAKE_MAGIC.len() + 2 + pw.len());
    hello.extend_from_slice(HANDSHAKE_MAGIC);
    hello.extend_from_slice(&(pw.len() as u16).to_be_bytes());
    hello.extend_from_slice(pw);
    Ok(hello)
}

async fn client_handshake(stream: &mut TcpStream, password: &str) -> LinkResult<()> {
    let hello = client_hello(password)?;
    stream.write_all(&hello).await?;

    let mut status = [0u8; 1];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut status))
        .await
        .map_err(|_| LinkError::HandshakeFailed("no response from server".to_string()))??;
    match status[0] {
        HS_OK => Ok(()),
        HS_BAD_PASSWORD => Err(LinkError::HandshakeFailed(
            "server rejected password".to_string(),
        )),
        other => Err(LinkError::HandshakeFailed(format!(
            "server rejected handshake (status {})",
            other
        ))),
    }
}

async fn server_handshake(stream: &mut TcpStream, expected: &str) -> LinkResult<()> {
    let mut header = [0u8; 8];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| LinkError::HandshakeFailed("client hello timed out".to_string()))??;

    if &header[..6] != HANDSHAKE_MAGIC {
        let _ = stream.write_all(&[HS_BAD_HANDSHAKE]).await;
        return Err(LinkError::HandshakeFailed("bad magic".to_string()));
    }

    let pw_len = u16::from_be_bytes([header[6], header[7]]) as usize;
    let mut pw = vec![0u8; pw_len];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut pw))
        .await
        .map_err(|_| LinkError::HandshakeFailed("password read timed out".to_string()))??;

    if pw != expected.as_bytes() {
        let _ = stream.write_all(&[HS_BAD_PASSWORD]).await;
        return Err(LinkError::HandshakeFailed("bad password".to_string()));
    }

    stream.write_all(&[HS_OK]).await?;
    Ok(())
}

/// Outbound password-authenticated TCP mesh link.
pub struct TcpMeshClientLink {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    metrics: Arc<LinkMetrics>,
    shutdown: ShutdownSignal,
}

impl TcpMeshClientLink {
    /// Start the link worker and return a handle.
    pub fn start(
        name: &str,
        config: TcpClientConfig,
        inbound_tx: mpsc::Sender<InboundFrame>,
        events: EventBus,
    ) -> Arc<TcpMeshClientLink> {
        let (tx, tx_rx) = mpsc::channel(config.tx_queue_size.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(LinkMetrics::new(name, "tcp"));
        let shutdown = ShutdownSignal::new();

        let link = Arc::new(TcpMeshClientLink {
            name: name.to_string(),
            tx,
            connected: connected.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        });

        let ctx = PumpCtx {
            link_name: name.to_string(),
            inbound_tx,
            metrics,
            connected,
            events,
            shutdown,
        };
        tokio::spawn(run_tcp_client(ctx, config, tx_rx));
        link
    }
}

impl Link for TcpMeshClientLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: Vec<u8>) -> LinkResult<()> {
        self.tx.try_send(frame).map_err(|_| {
            self.metrics.tx_dropped_no_conn();
            LinkError::QueueFull {
                link: self.name.clone(),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> LinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn note_dedup_suppressed(&self) {
        self.metrics.dedup_suppressed();
    }

    fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

async fn run_tcp_client(ctx: PumpCtx, config: TcpClientConfig, mut tx_rx: mpsc::Receiver<Vec<u8>>) {
    ctx.metrics.mark_started();
    info!(link = %ctx.link_name, host = %config.host, port = config.port, "tcp mesh client starting");

    let base = Duration::from_secs_f64(config.reconnect_backoff_base_s.max(0.1));
    let max = Duration::from_secs_f64(config.reconnect_backoff_max_s.max(0.1));
    let mut delay = base;

    while !ctx.shutdown.is_triggered() {
        ctx.metrics.connect_attempt();
        let attempt = TcpStream::connect((config.host.as_str(), config.port));
        let mut stream = tokio::select! {
            _ = ctx.shutdown.wait() => break,
            result = attempt => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(link = %ctx.link_name, error = %e, delay = ?delay, "connect failed, backing off");
                    if !backoff_wait(delay, &ctx, &mut tx_rx).await {
                        break;
                    }
                    delay = next_backoff(delay, max);
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        match client_handshake(&mut stream, &config.password).await {
            Ok(()) => {}
            Err(LinkError::HandshakeFailed(reason)) => {
                // A rejection is not transient. Stop rather than retry.
                error!(link = %ctx.link_name, reason = %reason, "handshake rejected, stopping link");
                ctx.metrics.tx_error("handshake rejected");
                break;
            }
            Err(e) => {
                debug!(link = %ctx.link_name, error = %e, "handshake transport error");
                if !backoff_wait(delay, &ctx, &mut tx_rx).await {
                    break;
                }
                delay = next_backoff(delay, max);
                continue;
            }
        }

        delay = base;
        ctx.mark_connected();
        info!(link = %ctx.link_name, "tcp mesh connection admitted");

        let end = pump_frames(stream, &ctx, &mut tx_rx).await;
        ctx.mark_disconnected("connection dropped");
        if end == ConnEnd::Stopped {
            break;
        }
    }

    ctx.mark_disconnected("stopped");
    ctx.metrics.mark_stopped();
    info!(link = %ctx.link_name, "tcp mesh client finished");
}

/// Listening TCP mesh link; admits one authenticated peer at a time.
pub struct TcpMeshServerLink {
    name: String,
    local_port: u16,
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    metrics: Arc<LinkMetrics>,
    shutdown: ShutdownSignal,
}

impl TcpMeshServerLink {
    /// Bind the listener and start the accept worker.
    pub async fn start(
        name: &str,
        config: TcpServerConfig,
        inbound_tx: mpsc::Sender<InboundFrame>,
        events: EventBus,
    ) -> LinkResult<Arc<TcpMeshServerLink>> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let local_port = listener.local_addr()?.port();
        info!(link = name, port = local_port, "tcp mesh server listening");

        let (tx, tx_rx) = mpsc::channel(config.tx_queue_size.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(LinkMetrics::new(name, "tcp-server"));
        let shutdown = ShutdownSignal::new();

        let link = Arc::new(TcpMeshServerLink {
            name: name.to_string(),
            local_port,
            tx,
            connected: connected.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        });

        let ctx = PumpCtx {
            link_name: name.to_string(),
            inbound_tx,
            metrics,
            connected,
            events,
            shutdown,
        };
        tokio::spawn(run_tcp_server(ctx, config, listener, tx_rx));
        Ok(link)
    }

    /// Port the listener is bound to. Useful when configured with port 0.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Link for TcpMeshServerLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: Vec<u8>) -> LinkResult<()> {
        self.tx.try_send(frame).map_err(|_| {
            self.metrics.tx_dropped_no_conn();
            LinkError::QueueFull {
                link: self.name.clone(),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> LinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn note_dedup_suppressed(&self) {
        self.metrics.dedup_suppressed();
    }

    fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

async fn run_tcp_server(
    ctx: PumpCtx,
    config: TcpServerConfig,
    listener: TcpListener,
    mut tx_rx: mpsc::Receiver<Vec<u8>>,
) {
    ctx.metrics.mark_started();

    'accept: while !ctx.shutdown.is_triggered() {
        let mut stream = tokio::select! {
            _ = ctx.shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(link = %ctx.link_name, peer = %addr, "inbound connection");
                    stream
                }
                Err(e) => {
                    warn!(link = %ctx.link_name, error = %e, "accept failed");
                    tokio::time::sleep(REJECT_PAUSE).await;
                    continue;
                }
            },
            // Nothing admitted yet; transmissions have nowhere to go.
            maybe = tx_rx.recv() => match maybe {
                None => break,
                Some(_) => {
                    ctx.metrics.tx_dropped_no_conn();
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        ctx.metrics.connect_attempt();
        if let Err(e) = server_handshake(&mut stream, &config.password).await {
            warn!(link = %ctx.link_name, error = %e, "rejected connection");
            // Pause briefly so repeated bad attempts cannot spin the loop.
            tokio::time::sleep(REJECT_PAUSE).await;
            continue 'accept;
        }

        ctx.mark_connected();
        info!(link = %ctx.link_name, "peer admitted");

        let end = pump_frames(stream, &ctx, &mut tx_rx).await;
        ctx.mark_disconnected("connection dropped");
        if end == ConnEnd::Stopped {
            break;
        }
    }

    ctx.mark_disconnected("stopped");
    ctx.metrics.mark_stopped();
    info!(link = %ctx.link_name, "tcp mesh server finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmesh_events::EventBus;
    use tokio::time::timeout;

    #[test]
    fn test_client_hello_layout() {
        let hello = client_hello("hunter2").unwrap();
        assert_eq!(&hello[..6], b"QMESH1");
        assert_eq!(&hello[6..8], &[0, 7]);
        assert_eq!(&hello[8..], b"hunter2");
    }

    #[test]
    fn test_client_hello_rejects_huge_password() {
        let password = "x".repeat(70_000);
        assert!(matches!(
            client_hello(&password),
            Err(LinkError::PasswordTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_server_link_admits_and_receives() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let server = TcpMeshServerLink::start(
            "backbone",
            TcpServerConfig {
                port: 0,
                password: "sekrit".to_string(),
                tx_queue_size: 8,
            },
            inbound_tx,
            EventBus::noop(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", server.local_port()))
            .await
            .unwrap();
        client_handshake(&mut client, "sekrit").await.unwrap();

        client
            .write_all(&crate::framing::frame_for_wire(b"over the wire").unwrap())
            .await
            .unwrap();
        let inbound = timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.bytes, b"over the wire");
        assert_eq!(inbound.link_name, "backbone");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_rejects_bad_password() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_side = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            server_handshake(&mut stream, "right").await
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let result = client_handshake(&mut client, "wrong").await;
        assert!(matches!(result, Err(LinkError::HandshakeFailed(_))));
        assert!(server_side.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_side = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            server_handshake(&mut stream, "pw").await
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"BOGUS!\x00\x02pw").await.unwrap();
        let mut status = [0u8; 1];
        timeout(Duration::from_secs(2), client.read_exact(&mut status))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status[0], HS_BAD_HANDSHAKE);
        assert!(server_side.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_link_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);

        let link = TcpMeshClientLink::start(
            "wire-0",
            TcpClientConfig {
                host: "127.0.0.1".to_string(),
                port,
                password: "sekrit".to_string(),
                reconnect_backoff_base_s: 0.05,
                reconnect_backoff_max_s: 0.2,
                tx_queue_size: 8,
            },
            inbound_tx,
            EventBus::noop(),
        );

        let (mut peer, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        server_handshake(&mut peer, "sekrit").await.unwrap();

        peer.write_all(&crate::framing::frame_for_wire(b"admitted").unwrap())
            .await
            .unwrap();
        let inbound = timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.bytes, b"admitted");
        assert!(link.is_connected());
        link.shutdown();
    }
}
