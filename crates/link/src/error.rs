//! Error types for link operations.

use thiserror::Error;

/// Errors that can occur on a link or the multiplexer.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Socket I/O failure; the link closes and reconnects
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer rejected or botched the admission handshake
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Frame exceeds what a 16-bit length prefix can carry
    #[error("frame too large for wire: {len} bytes")]
    FrameTooLarge {
        /// Size of the offending frame
        len: usize,
    },

    /// The link's transmit queue is full; the frame was dropped
    #[error("transmit queue full on link {link}")]
    QueueFull {
        /// Link that refused the frame
        link: String,
    },

    /// No connected link accepted the frame
    #[error("no connected link accepted the frame")]
    NoLinkAvailable,

    /// Password too long for the handshake length field
    #[error("password too long: {0} bytes")]
    PasswordTooLong(usize),
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
