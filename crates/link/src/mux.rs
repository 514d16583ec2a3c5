//! Link multiplexer.
//!
//! Owns the ordered set of links. Transmissions fan out to every connected
//! link; inbound frames from all links merge into one queue, each tagged
//! with its source link. Upper layers see exactly one input stream and one
//! output sink and never deal with individual transports.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{LinkError, LinkResult};
use crate::metrics::LinkMetricsSnapshot;
use crate::{InboundFrame, LinkRef};

/// Fan-out sender and merged receiver over a set of links.
pub struct Multiplexer {
    links: Mutex<Vec<LinkRef>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
}

impl Multiplexer {
    /// Build a multiplexer whose merged inbound queue holds `queue_size`
    /// frames before links experience backpressure.
    pub fn new(queue_size: usize) -> Multiplexer {
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_size.max(1));
        Multiplexer {
            links: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// The sender every link feeds its received frames into.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundFrame> {
        self.inbound_tx.clone()
    }

    /// Register a link. Links are tried in registration order.
    pub fn add_link(&self, link: LinkRef) {
        self.links.lock().unwrap().push(link);
    }

    /// Take the merged inbound queue. There is exactly one consumer; second
    /// calls return None.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound_rx.lock().unwrap().take()
    }

    /// Broadcast a frame to every connected link.
    ///
    /// A per-link failure is logged and the transmission counts as
    /// successful if at least one link accepted the frame.
    pub fn send(&self, frame: &[u8]) -> LinkResult<()> {
        let links = self.links.lock().unwrap();
        let mut accepted = 0usize;
        for link in links.iter() {
            if !link.is_connected() {
                continue;
            }
            match link.send(frame.to_vec()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    debug!(link = link.name(), error = %e, "link refused frame");
                }
            }
        }
        if accepted == 0 {
            return Err(LinkError::NoLinkAvailable);
        }
        Ok(())
    }

    /// Send a frame on one named link, falling back to broadcast when the
    /// link is unknown or down.
    pub fn send_via(&self, link_name: &str, frame: &[u8]) -> LinkResult<()> {
        {
            let links = self.links.lock().unwrap();
            if let Some(link) = links.iter().find(|l| l.name() == link_name) {
                if link.is_connected() && link.send(frame.to_vec()).is_ok() {
                    return Ok(());
                }
            }
        }
        self.send(frame)
    }

    /// Record a duplicate frame first observed through the named link.
    pub fn note_dedup_suppressed(&self, link_name: &str) {
        let links = self.links.lock().unwrap();
        if let Some(link) = links.iter().find(|l| l.name() == link_name) {
            // Metrics handles live behind the trait; snapshotting is the
            // read path, this is the one write-through.
            link.note_dedup_suppressed();
        }
    }

    /// Snapshots of every link's counters.
    pub fn metrics(&self) -> Vec<LinkMetricsSnapshot> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.metrics())
            .collect()
    }

    /// Whether any link currently has a connected peer.
    pub fn any_connected(&self) -> bool {
        self.links.lock().unwrap().iter().any(|l| l.is_connected())
    }

    /// Stop every link. Idempotent.
    pub fn shutdown(&self) {
        for link in self.links.lock().unwrap().iter() {
            link.shutdown();
        }
    }
}
