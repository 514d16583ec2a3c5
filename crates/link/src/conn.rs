//! Connected-phase frame pump shared by the transport variants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qmesh_events::{Event, EventBus, ShutdownSignal};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::framing::{frame_for_wire, FrameBuffer};
use crate::metrics::LinkMetrics;
use crate::InboundFrame;

const READ_CHUNK: usize = 4096;

/// Why the connected phase ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnEnd {
    /// Shutdown was requested; the worker should exit
    Stopped,
    /// The connection was lost; the worker may reconnect
    Lost,
}

/// Everything a connection pump needs besides the socket itself.
pub(crate) struct PumpCtx {
    pub link_name: String,
    pub inbound_tx: mpsc::Sender<InboundFrame>,
    pub metrics: Arc<LinkMetrics>,
    pub connected: Arc<AtomicBool>,
    pub events: EventBus,
    pub shutdown: ShutdownSignal,
}

impl PumpCtx {
    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.metrics.connected();
        self.events.publish(Event::LinkStateChange {
            link: self.link_name.clone(),
            up: true,
        });
    }

    pub(crate) fn mark_disconnected(&self, reason: &str) {
        let was_up = self.connected.swap(false, Ordering::SeqCst);
        self.metrics.disconnected(reason);
        if was_up {
            self.events.publish(Event::LinkStateChange {
                link: self.link_name.clone(),
                up: false,
            });
        }
    }
}

/// Shuttle frames over an established stream until it drops or shutdown.
///
/// Reads are reassembled through a [`FrameBuffer`]; writes drain the link's
/// transmit queue and go out length-prefixed and whole.
pub(crate) async fn pump_frames(
    mut stream: TcpStream,
    ctx: &PumpCtx,
    tx_rx: &mut mpsc::Receiver<Vec<u8>>,
) -> ConnEnd {
    let (mut rd, mut wr) = stream.split();
    let mut buffer = FrameBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => return ConnEnd::Stopped,

            read = rd.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(link = %ctx.link_name, "peer closed connection");
                    return ConnEnd::Lost;
                }
                Ok(n) => {
                    buffer.extend(&chunk[..n]);
                    while let Some(frame) = buffer.next_frame() {
                        ctx.metrics.record_rx(frame.len());
                        let inbound = InboundFrame {
                            bytes: frame,
                            link_name: ctx.link_name.clone(),
                        };
                        if ctx.inbound_tx.send(inbound).await.is_err() {
                            // Mesh side is gone; nothing left to feed.
                            return ConnEnd::Stopped;
                        }
                    }
                }
                Err(e) => {
                    ctx.metrics.rx_error("read failed");
                    debug!(link = %ctx.link_name, error = %e, "read failed");
                    return ConnEnd::Lost;
                }
            },

            maybe = tx_rx.recv() => match maybe {
                None => return ConnEnd::Stopped,
                Some(frame) => {
                    let wire = match frame_for_wire(&frame) {
                        Ok(wire) => wire,
                        Err(e) => {
                            warn!(link = %ctx.link_name, error = %e, "dropping oversize frame");
                            ctx.metrics.tx_error("oversize frame");
                            continue;
                        }
                    };
                    if let Err(e) = wr.write_all(&wire).await {
                        ctx.metrics.tx_error("write failed");
                        debug!(link = %ctx.link_name, error = %e, "write failed");
                        return ConnEnd::Lost;
                    }
                    ctx.metrics.record_tx(frame.len());
                }
            },
        }
    }
}

/// Wait out a backoff interval. Queued transmissions arriving meanwhile are
/// dropped and counted so senders never observe a stall. Returns false when
/// shutdown fired during the wait.
pub(crate) async fn backoff_wait(
    delay: Duration,
    ctx: &PumpCtx,
    tx_rx: &mut mpsc::Receiver<Vec<u8>>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = ctx.shutdown.wait() => return false,
            maybe = tx_rx.recv() => match maybe {
                None => return false,
                Some(_) => ctx.metrics.tx_dropped_no_conn(),
            },
        }
    }
}

/// Double a backoff delay up to its cap.
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
