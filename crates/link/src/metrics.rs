//! Per-link observational counters.
//!
//! Metrics exist for diagnostics only. Nothing in routing or forwarding may
//! read them to make a decision.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Point-in-time copy of a link's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkMetricsSnapshot {
    /// Link name
    pub name: String,
    /// Transport kind, e.g. `ardop` or `tcp`
    pub link_type: String,
    /// Whether the link worker is running
    pub running: bool,
    /// Whether a peer is currently connected
    pub connected: bool,
    /// Unix seconds the link started
    pub started_ts: u64,
    /// Seconds since the link worker started
    pub uptime_s: u64,
    /// Unix seconds of the last successful connect
    pub last_connect_ts: u64,
    /// Unix seconds of the last disconnect
    pub last_disconnect_ts: u64,
    /// Unix seconds of the last received frame
    pub last_rx_ts: u64,
    /// Unix seconds of the last transmitted frame
    pub last_tx_ts: u64,
    /// Frames received
    pub rx_frames: u64,
    /// Frames transmitted
    pub tx_frames: u64,
    /// Payload bytes received
    pub rx_bytes: u64,
    /// Payload bytes transmitted
    pub tx_bytes: u64,
    /// Connection attempts
    pub connect_attempts: u64,
    /// Successful connections
    pub connect_successes: u64,
    /// Times the connection dropped
    pub disconnects: u64,
    /// Frames dropped because no connection was available
    pub tx_dropped_no_conn: u64,
    /// Transmit errors
    pub tx_errors: u64,
    /// Receive errors
    pub rx_errors: u64,
    /// Duplicate frames first seen through this link
    pub dedup_suppressions: u64,
    /// Tag of the most recent error
    pub last_error: String,
}

/// Shared counter cell owned by a link and read by diagnostics.
#[derive(Debug)]
pub struct LinkMetrics {
    inner: Mutex<LinkMetricsSnapshot>,
}

impl LinkMetrics {
    /// Fresh counters for a named link.
    pub fn new(name: &str, link_type: &str) -> Self {
        LinkMetrics {
            inner: Mutex::new(LinkMetricsSnapshot {
                name: name.to_string(),
                link_type: link_type.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Record worker start.
    pub fn mark_started(&self) {
        let mut m = self.inner.lock().unwrap();
        m.running = true;
        m.started_ts = now_ts();
    }

    /// Record worker stop.
    pub fn mark_stopped(&self) {
        let mut m = self.inner.lock().unwrap();
        m.running = false;
        m.connected = false;
    }

    /// Record a connection attempt.
    pub fn connect_attempt(&self) {
        self.inner.lock().unwrap().connect_attempts += 1;
    }

    /// Record a successful connection.
    pub fn connected(&self) {
        let mut m = self.inner.lock().unwrap();
        m.connected = true;
        m.connect_successes += 1;
        m.last_connect_ts = now_ts();
        m.last_error.clear();
    }

    /// Record a lost or closed connection.
    pub fn disconnected(&self, reason: &str) {
        let mut m = self.inner.lock().unwrap();
        if m.connected {
            m.disconnects += 1;
        }
        m.connected = false;
        m.last_disconnect_ts = now_ts();
        if !reason.is_empty() {
            m.last_error = reason.to_string();
        }
    }

    /// Record a received frame.
    pub fn record_rx(&self, bytes: usize) {
        let mut m = self.inner.lock().unwrap();
        m.rx_frames += 1;
        m.rx_bytes += bytes as u64;
        m.last_rx_ts = now_ts();
    }

    /// Record a transmitted frame.
    pub fn record_tx(&self, bytes: usize) {
        let mut m = self.inner.lock().unwrap();
        m.tx_frames += 1;
        m.tx_bytes += bytes as u64;
        m.last_tx_ts = now_ts();
    }

    /// Record a frame dropped for lack of a connection.
    pub fn tx_dropped_no_conn(&self) {
        self.inner.lock().unwrap().tx_dropped_no_conn += 1;
    }

    /// Record a transmit failure.
    pub fn tx_error(&self, reason: &str) {
        let mut m = self.inner.lock().unwrap();
        m.tx_errors += 1;
        m.last_error = reason.to_string();
    }

    /// Record a receive failure.
    pub fn rx_error(&self, reason: &str) {
        let mut m = self.inner.lock().unwrap();
        m.rx_errors += 1;
        m.last_error = reason.to_string();
    }

    /// Record a duplicate frame first observed through this link.
    pub fn dedup_suppressed(&self) {
        self.inner.lock().unwrap().dedup_suppressions += 1;
    }

    /// Copy out the current counters.
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        let mut snap = self.inner.lock().unwrap().clone();
        if snap.running && snap.started_ts > 0 {
            snap.uptime_s = now_ts().saturating_sub(snap.started_ts);
        }
        snap
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
