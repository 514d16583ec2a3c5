//! Error types for mesh node operations.

use thiserror::Error;

/// Errors surfaced by the mesh node's caller-facing operations.
///
/// The receive pipeline never propagates errors upward; everything there is
/// dropped, counted or logged in place.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Frame could not be encoded
    #[error("codec error: {0}")]
    Codec(#[from] qmesh_codec::CodecError),

    /// No connected link accepted the frame
    #[error("transmit failed: {0}")]
    Transmit(#[from] qmesh_link::LinkError),

    /// The node has been shut down
    #[error("mesh node is stopped")]
    Stopped,
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
