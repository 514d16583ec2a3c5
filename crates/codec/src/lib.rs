//! QMesh wire codec.
//!
//! Pure encode/decode for everything that crosses a link: the 16-byte mesh
//! header, OGM and DATA bodies, conditional deflate compression, optional
//! AEAD sealing, and the JSON chat payload envelope carried inside DATA
//! frames. The codec performs no I/O and holds no connection state.

#![warn(missing_docs)]

pub mod chat;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod node_id;

pub use chat::{ChatPayload, SyncMode, SyncRow, CHAT_PROTOCOL_VERSION};
pub use crypto::{data_aad, PayloadCipher, KEY_LEN, NONCE_LEN};
pub use error::{CodecError, CodecResult};
pub use frame::{
    DataBody, Frame, FrameBody, FrameCodec, FrameHeader, MsgType, OgmBody, FLAG_COMPRESSED,
    FLAG_ENCRYPTED, HEADER_LEN, MAX_FRAME_LEN, MESH_VERSION, OGM_BODY_LEN,
};
pub use node_id::{NodeId, NODE_ID_LEN};
