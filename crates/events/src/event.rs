//! The event taxonomy visible to observers.

use qmesh_codec::NodeId;
use serde::Serialize;

/// Everything the stack reports to observers, one variant per event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    /// A locally originated chat message was handed to the mesh
    MessageSent {
        /// Channel or DM key
        channel: String,
        /// Destination node
        dest: NodeId,
        /// Seqno the mesh assigned
        seqno: u32,
    },
    /// A chat message addressed to this node arrived
    MessageReceived {
        /// Channel or DM key
        channel: String,
        /// Originating node
        origin: NodeId,
        /// Per-origin seqno
        seqno: u32,
        /// Sender nickname
        nick: String,
    },
    /// A chat message was newly persisted
    MessageStored {
        /// Channel or DM key
        channel: String,
        /// Originating node
        origin: NodeId,
        /// Per-origin seqno
        seqno: u32,
    },
    /// A hole in a per-channel sequence met the confirmation criteria
    GapDetected {
        /// Channel the gap belongs to
        channel: String,
        /// Origin whose rows are missing
        origin: NodeId,
        /// First missing seqno
        start: u32,
        /// Last missing seqno
        end: u32,
    },
    /// A sync response was applied; counts only rows newly stored
    SyncApplied {
        /// Channel the rows belong to
        channel: String,
        /// Rows newly inserted by this response
        applied_count: usize,
    },
    /// A retention prune pass finished
    PruneExecuted {
        /// Rows deleted by the pass
        deleted_rows: usize,
    },
    /// A link changed connection state
    LinkStateChange {
        /// Link name
        link: String,
        /// True when the link came up
        up: bool,
    },
}

impl Event {
    /// Stable observer-facing name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessageSent { .. } => "on_message_sent",
            Event::MessageReceived { .. } => "on_message_received",
            Event::MessageStored { .. } => "on_message_stored",
            Event::GapDetected { .. } => "on_gap_detected",
            Event::SyncApplied { .. } => "on_sync_applied",
            Event::PruneExecuted { .. } => "on_prune_executed",
            Event::LinkStateChange { .. } => "on_link_state_change",
        }
    }
}
