//! ARDOP link: a TCP client to the TNC's byte-stream data port.
//!
//! The modem process presents a reliable full-duplex byte stream; this link
//! treats it as such and adds only the length-prefix framing. No admission
//! handshake, the TNC is assumed local and trusted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qmesh_events::{EventBus, ShutdownSignal};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::conn::{backoff_wait, next_backoff, pump_frames, ConnEnd, PumpCtx};
use crate::error::{LinkError, LinkResult};
use crate::metrics::{LinkMetrics, LinkMetricsSnapshot};
use crate::{InboundFrame, Link};

/// Connection settings for the ARDOP TNC data port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArdopLinkConfig {
    /// TNC host
    pub host: String,
    /// TNC data port
    pub port: u16,
    /// Initial reconnect delay in seconds
    pub reconnect_backoff_base_s: f64,
    /// Reconnect delay cap in seconds
    pub reconnect_backoff_max_s: f64,
    /// Frames queued for transmission before drops begin
    pub tx_queue_size: usize,
}

impl Default for ArdopLinkConfig {
    fn default() -> Self {
        ArdopLinkConfig {
            host: "127.0.0.1".to_string(),
            port: 8515,
            reconnect_backoff_base_s: 5.0,
            reconnect_backoff_max_s: 60.0,
            tx_queue_size: 1000,
        }
    }
}

/// TCP client link to the ARDOP TNC.
pub struct ArdopLink {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    metrics: Arc<LinkMetrics>,
    shutdown: ShutdownSignal,
}

impl ArdopLink {
    /// Start the link worker and return a handle.
    pub fn start(
        name: &str,
        config: ArdopLinkConfig,
        inbound_tx: mpsc::Sender<InboundFrame>,
        events: EventBus,
    ) -> Arc<ArdopLink> {
        let (tx, tx_rx) = mpsc::channel(config.tx_queue_size.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(LinkMetrics::new(name, "ardop"));
        let shutdown = ShutdownSignal::new();

        let link = Arc::new(ArdopLink {
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
        tokio::spawn(run_client(ctx, config, tx_rx));
        link
    }
}

impl Link for ArdopLink {
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

async fn run_client(ctx: PumpCtx, config: ArdopLinkConfig, mut tx_rx: mpsc::Receiver<Vec<u8>>) {
    ctx.metrics.mark_started();
    info!(link = %ctx.link_name, host = %config.host, port = config.port, "ardop link starting");

    let base = Duration::from_secs_f64(config.reconnect_backoff_base_s.max(0.1));
    let max = Duration::from_secs_f64(config.reconnect_backoff_max_s.max(0.1));
    let mut delay = base;

    while !ctx.shutdown.is_triggered() {
        ctx.metrics.connect_attempt();
        let attempt = TcpStream::connect((config.host.as_str(), config.port));
        let stream = tokio::select! {
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

        delay = base;
        ctx.mark_connected();
        info!(link = %ctx.link_name, "ardop connection established");

        let end = pump_frames(stream, &ctx, &mut tx_rx).await;
        ctx.mark_disconnected("connection dropped");
        match end {
            ConnEnd::Stopped => break,
            ConnEnd::Lost => {
                debug!(link = %ctx.link_name, "reconnecting");
            }
        }
    }

    ctx.mark_disconnected("stopped");
    ctx.metrics.mark_stopped();
    info!(link = %ctx.link_name, "ardop link finished");
}
