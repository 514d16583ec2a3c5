//! Error types for the chat layer.

use thiserror::Error;

use crate::client::NodeMode;

/// Errors surfaced to callers of the chat client.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The node's mode does not permit this operation
    #[error("operation not permitted in {0:?} mode")]
    WrongMode(NodeMode),

    /// A DM was addressed to a nickname with no known node id
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// A channel message was sent but no default peer is configured
    #[error("no default peer configured for channel traffic")]
    NoDefaultPeer,

    /// Payload could not be encoded
    #[error("codec error: {0}")]
    Codec(#[from] qmesh_codec::CodecError),

    /// The mesh refused the send
    #[error("mesh error: {0}")]
    Mesh(#[from] qmesh_mesh::MeshError),

    /// The local store failed
    #[error("store error: {0}")]
    Store(#[from] qmesh_store::StoreError),
}

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
