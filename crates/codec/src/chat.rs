//! Chat payload envelope.
//!
//! Every DATA payload at the chat layer is one versioned JSON document:
//! a live chat message, a sync request (inventory or range mode) or a sync
//! response carrying stored rows. `created_ts` is stamped by the sender in
//! UTC unix seconds and exists purely for human ordering and display; it is
//! never consulted for transmission timing or deduplication.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// Current chat envelope version.
pub const CHAT_PROTOCOL_VERSION: u8 = 1;

/// How a sync request scopes the rows it wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// The most recent rows on the channel, for discovery
    Inventory,
    /// A specific contiguous seqno range for one origin
    Range,
}

/// One stored chat row as carried in a sync response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Hex form of the row's origin id
    pub origin_id_hex: String,
    /// Per-origin sequence number
    pub seqno: u32,
    /// Sender nickname
    pub nick: String,
    /// Message text
    pub text: String,
    /// Sender-stamped UTC unix seconds
    pub created_ts: u64,
}

/// Typed chat payload, one variant per message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPayload {
    /// A live chat message
    Chat {
        /// `#name` channel or `@CALLSIGN` DM key
        channel: String,
        /// Sender nickname
        nick: String,
        /// Message text
        text: String,
        /// Sender-stamped UTC unix seconds
        created_ts: u64,
    },
    /// A request for rows the sender is missing
    SyncRequest {
        /// Channel the request is scoped to
        channel: String,
        /// Requesting nickname
        nick: String,
        /// Inventory or range
        mode: SyncMode,
        /// Target origin for range mode, hex form
        origin_id_hex: String,
        /// First seqno wanted, range mode only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<u32>,
        /// Last seqno wanted, range mode only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<u32>,
    },
    /// Rows answering a sync request
    SyncResponse {
        /// Channel the rows belong to
        channel: String,
        /// Responding nickname
        nick: String,
        /// Stored rows, at most one response frame's worth
        rows: Vec<SyncRow>,
    },
}

impl ChatPayload {
    /// The channel this payload is scoped to.
    pub fn channel(&self) -> &str {
        match self {
            ChatPayload::Chat { channel, .. }
            | ChatPayload::SyncRequest { channel, .. }
            | ChatPayload::SyncResponse { channel, .. } => channel,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    #[serde(flatten)]
    payload: ChatPayload,
}

/// Serialize a chat payload into its versioned wire form.
pub fn encode_chat_payload(payload: &ChatPayload) -> CodecResult<Vec<u8>> {
    let envelope = Envelope {
        v: CHAT_PROTOCOL_VERSION,
        payload: payload.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a versioned chat payload.
pub fn decode_chat_payload(bytes: &[u8]) -> CodecResult<ChatPayload> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.v != CHAT_PROTOCOL_VERSION {
        return Err(CodecError::UnknownChatVersion(envelope.v));
    }
    Ok(envelope.payload)
}

/// Whether a channel key names a direct-message conversation.
pub fn is_dm_channel(channel: &str) -> bool {
    channel.starts_with('@')
}
