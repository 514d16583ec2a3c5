//! Node identity derived from an amateur radio callsign.
//!
//! A node id is the callsign uppercased, right-padded with ASCII spaces and
//! truncated to exactly 8 bytes. It is carried verbatim in the origin and
//! destination fields of every frame; two derivations of the same callsign
//! always compare equal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// Wire width of a node id in bytes.
pub const NODE_ID_LEN: usize = 8;

/// Fixed 8-byte node identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive a node id from an ASCII callsign.
    ///
    /// The callsign is uppercased, padded on the right with 0x20 and
    /// truncated to 8 bytes. Rejects empty or non-ASCII input.
    pub fn from_callsign(callsign: &str) -> CodecResult<Self> {
        let trimmed = callsign.trim();
        if trimmed.is_empty() {
            return Err(CodecError::InvalidNodeId("empty callsign".to_string()));
        }
        if !trimmed.is_ascii() || trimmed.chars().any(|c| c.is_ascii_control()) {
            return Err(CodecError::InvalidNodeId(format!(
                "callsign {:?} is not printable ASCII",
                callsign
            )));
        }
        let mut id = [0x20u8; NODE_ID_LEN];
        for (slot, byte) in id.iter_mut().zip(trimmed.bytes()) {
            *slot = byte.to_ascii_uppercase();
        }
        Ok(NodeId(id))
    }

    /// Wrap raw bytes as a node id.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Read a node id from the start of a byte slice.
    pub fn from_slice(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < NODE_ID_LEN {
            return Err(CodecError::Truncated {
                needed: NODE_ID_LEN,
                got: bytes.len(),
            });
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&bytes[..NODE_ID_LEN]);
        Ok(NodeId(id))
    }

    /// Parse a node id from its 16-character hex form.
    pub fn from_hex(hex_str: &str) -> CodecResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CodecError::InvalidNodeId(format!("bad hex: {}", e)))?;
        if bytes.len() != NODE_ID_LEN {
            return Err(CodecError::InvalidNodeId(format!(
                "hex id must decode to {} bytes, got {}",
                NODE_ID_LEN,
                bytes.len()
            )));
        }
        Self::from_slice(&bytes)
    }

    /// Hex form used in config files and sync payloads.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Callsign with the pad stripped. Lossy for ids not derived from ASCII.
    pub fn callsign(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .trim_end_matches(' ')
            .to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.callsign())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.callsign())
    }
}
