//! Error types for codec operations.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before a complete structure could be read
    #[error("truncated input: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum number of bytes required
        needed: usize,
        /// Number of bytes actually available
        got: usize,
    },

    /// Frame carries a protocol version this codec does not speak
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),

    /// Frame carries an unrecognized message type byte
    #[error("unknown message type {0}")]
    UnknownMsgType(u8),

    /// Compressed payload did not inflate cleanly
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Encoded frame would exceed the 16-bit length-prefix bound
    #[error("frame too large: {len} bytes exceeds {max}")]
    FrameTooLarge {
        /// Size the encoded frame would have
        len: usize,
        /// Hard wire limit
        max: usize,
    },

    /// An encrypted frame was requested or received while the cipher is off
    #[error("payload encryption is not enabled")]
    EncryptionDisabled,

    /// AEAD seal or open failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Chat payload envelope could not be serialized or parsed
    #[error("chat envelope error: {0}")]
    ChatEnvelope(#[from] serde_json::Error),

    /// Chat payload envelope version mismatch
    #[error("unknown chat protocol version {0}")]
    UnknownChatVersion(u8),

    /// Callsign or node id input was not usable
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
