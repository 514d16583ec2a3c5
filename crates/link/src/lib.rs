//! Link layer: framed byte-stream transports and the multiplexer.
//!
//! A link is one bidirectional byte stream carrying length-prefixed mesh
//! frames: the ARDOP TNC data port, or a password-authenticated TCP mesh
//! connection (client or server side). Links own their reconnect policy and
//! counters; the multiplexer fans transmissions across all of them and
//! merges every inbound frame into a single tagged queue for the mesh node.

pub mod ardop;
mod conn;
pub mod error;
pub mod framing;
pub mod metrics;
pub mod mux;
pub mod tcp;

use std::sync::Arc;

pub use ardop::{ArdopLink, ArdopLinkConfig};
pub use error::{LinkError, LinkResult};
pub use framing::{frame_for_wire, FrameBuffer, MAX_WIRE_FRAME};
pub use metrics::{LinkMetrics, LinkMetricsSnapshot};
pub use mux::Multiplexer;
pub use tcp::{TcpClientConfig, TcpMeshClientLink, TcpMeshServerLink, TcpServerConfig};

/// A mesh frame received from some link, tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Raw mesh frame bytes, length prefix already stripped
    pub bytes: Vec<u8>,
    /// Name of the link the frame arrived on
    pub link_name: String,
}

/// Common surface every transport variant exposes to the multiplexer.
pub trait Link: Send + Sync {
    /// Stable link name used in logs, metrics and frame tags.
    fn name(&self) -> &str;

    /// Queue one mesh frame for transmission. Never blocks; a full queue
    /// drops the frame and reports [`LinkError::QueueFull`].
    fn send(&self, frame: Vec<u8>) -> LinkResult<()>;

    /// Whether a peer is currently connected and admitted.
    fn is_connected(&self) -> bool;

    /// Copy of the link's counters.
    fn metrics(&self) -> LinkMetricsSnapshot;

    /// Record a duplicate frame whose first copy arrived through this link.
    fn note_dedup_suppressed(&self);

    /// Stop the link's workers and close the connection. Idempotent.
    fn shutdown(&self);
}

/// Shared handle type for links held by the multiplexer.
pub type LinkRef = Arc<dyn Link>;
