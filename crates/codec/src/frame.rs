//! Mesh frame format.
//!
//! Canonical definitions for the QMesh on-wire frame: a fixed 16-byte
//! big-endian header followed by a type-dependent body. All constants here
//! are the single source of truth.
//!
//! ```text
//! offset size field
//! 0      1    version (currently 1)
//! 1      1    message type (DATA = 0, OGM = 1)
//! 2      1    flags (bit0 compressed, bit1 encrypted, rest reserved zero)
//! 3      1    ttl (remaining hops including the current one)
//! 4      8    origin id
//! 12     4    seqno (big-endian u32)
//! ```
//!
//! OGM body: `prev_hop(8) || metric(1)`. DATA body:
//! `dest(8) || data_seqno(4) || payload`, where the payload is deflated when
//! the compressed flag is set and `nonce(12) || ciphertext` when the
//! encrypted flag is set.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::crypto::{data_aad, PayloadCipher, NONCE_LEN};
use crate::error::{CodecError, CodecResult};
use crate::node_id::{NodeId, NODE_ID_LEN};

/// Current mesh protocol version.
pub const MESH_VERSION: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest frame a 16-bit length prefix can carry.
pub const MAX_FRAME_LEN: usize = 65535;

/// Flag bit: body payload is deflate-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Flag bit: body payload is AEAD-sealed.
pub const FLAG_ENCRYPTED: u8 = 0x02;

/// OGM body length: previous hop id plus one metric byte.
pub const OGM_BODY_LEN: usize = NODE_ID_LEN + 1;

/// Minimum DATA body length: destination id plus data seqno.
pub const DATA_BODY_MIN_LEN: usize = NODE_ID_LEN + 4;

/// Default payload size above which compression is attempted.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 64;

/// Mesh message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Application payload frame
    Data = 0,
    /// Routing beacon
    Ogm = 1,
}

impl TryFrom<u8> for MsgType {
    type Error = CodecError;

    fn try_from(value: u8) -> CodecResult<Self> {
        match value {
            0 => Ok(MsgType::Data),
            1 => Ok(MsgType::Ogm),
            other => Err(CodecError::UnknownMsgType(other)),
        }
    }
}

/// Parsed 16-byte mesh header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Message type
    pub msg_type: MsgType,
    /// Flag bits
    pub flags: u8,
    /// Remaining hop budget, including the current hop
    pub ttl: u8,
    /// Originating node, never rewritten by forwarders
    pub origin: NodeId,
    /// Per-origin frame sequence number
    pub seqno: u32,
}

impl FrameHeader {
    /// Append the 16-byte wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.msg_type as u8);
        out.push(self.flags);
        out.push(self.ttl);
        out.extend_from_slice(self.origin.as_bytes());
        out.extend_from_slice(&self.seqno.to_be_bytes());
    }

    /// Parse a header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        let version = bytes[0];
        if version != MESH_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        let msg_type = MsgType::try_from(bytes[1])?;
        let origin = NodeId::from_slice(&bytes[4..12])?;
        let seqno = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Ok(FrameHeader {
            version,
            msg_type,
            flags: bytes[2],
            ttl: bytes[3],
            origin,
            seqno,
        })
    }

    /// Whether the compressed flag is set.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Whether the encrypted flag is set.
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// Routing beacon body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OgmBody {
    /// The node that transmitted this copy of the beacon
    pub prev_hop: NodeId,
    /// Cumulative path cost from the originator, lower is better
    pub metric: u8,
}

impl OgmBody {
    /// Encode to the 9-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(OGM_BODY_LEN);
        out.extend_from_slice(self.prev_hop.as_bytes());
        out.push(self.metric);
        out
    }

    /// Parse from a raw frame body.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < OGM_BODY_LEN {
            return Err(CodecError::Truncated {
                needed: OGM_BODY_LEN,
                got: bytes.len(),
            });
        }
        Ok(OgmBody {
            prev_hop: NodeId::from_slice(&bytes[..NODE_ID_LEN])?,
            metric: bytes[NODE_ID_LEN],
        })
    }
}

/// Application payload body with the payload in clear form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    /// Destination node
    pub dest: NodeId,
    /// Application-level sequence number
    pub data_seqno: u32,
    /// Clear application payload
    pub payload: Vec<u8>,
}

impl DataBody {
    /// Read the destination and data seqno without touching the payload.
    ///
    /// Forwarders use this so frames in transit are never decompressed or
    /// unsealed.
    pub fn peek(raw_body: &[u8]) -> CodecResult<(NodeId, u32)> {
        if raw_body.len() < DATA_BODY_MIN_LEN {
            return Err(CodecError::Truncated {
                needed: DATA_BODY_MIN_LEN,
                got: raw_body.len(),
            });
        }
        let dest = NodeId::from_slice(&raw_body[..NODE_ID_LEN])?;
        let data_seqno = u32::from_be_bytes([
            raw_body[NODE_ID_LEN],
            raw_body[NODE_ID_LEN + 1],
            raw_body[NODE_ID_LEN + 2],
            raw_body[NODE_ID_LEN + 3],
        ]);
        Ok((dest, data_seqno))
    }
}

/// A fully decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Routing beacon
    Ogm(OgmBody),
    /// Application payload
    Data(DataBody),
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Parsed header
    pub header: FrameHeader,
    /// Parsed body with any compression and sealing undone
    pub body: FrameBody,
}

/// Stateless frame encoder/decoder.
///
/// Owns only policy: the compression threshold and the payload cipher.
#[derive(Debug)]
pub struct FrameCodec {
    compress_threshold: usize,
    cipher: PayloadCipher,
}

impl FrameCodec {
    /// Build a codec with the given compression threshold and cipher.
    pub fn new(compress_threshold: usize, cipher: PayloadCipher) -> Self {
        FrameCodec {
            compress_threshold,
            cipher,
        }
    }

    /// A codec with default compression policy and sealing disabled.
    pub fn plain() -> Self {
        Self::new(DEFAULT_COMPRESS_THRESHOLD, PayloadCipher::disabled())
    }

    /// Encode an OGM frame. Beacons are never compressed or sealed.
    pub fn encode_ogm(origin: NodeId, seqno: u32, ttl: u8, body: &OgmBody) -> Vec<u8> {
        let header = FrameHeader {
            version: MESH_VERSION,
            msg_type: MsgType::Ogm,
            flags: 0,
            ttl,
            origin,
            seqno,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + OGM_BODY_LEN);
        header.encode_into(&mut out);
        out.extend_from_slice(&body.encode());
        out
    }

    /// Encode a DATA frame.
    ///
    /// Compression is attempted when the payload exceeds the threshold and
    /// kept only when it actually shortens the payload. Sealing happens after
    /// compression and only when the cipher is enabled; the flags record
    /// exactly what was applied.
    pub fn encode_data(
        &self,
        origin: NodeId,
        seqno: u32,
        ttl: u8,
        dest: NodeId,
        data_seqno: u32,
        payload: &[u8],
    ) -> CodecResult<Vec<u8>> {
        let mut flags = 0u8;

        let mut body_payload = if payload.len() > self.compress_threshold {
            let compressed = deflate(payload)?;
            if compressed.len() < payload.len() {
                flags |= FLAG_COMPRESSED;
                compressed
            } else {
                payload.to_vec()
            }
        } else {
            payload.to_vec()
        };

        let mut sealed_prefix: Option<[u8; NONCE_LEN]> = None;
        if self.cipher.is_enabled() {
            let aad = data_aad(&origin, &dest, data_seqno);
            let (nonce, ciphertext) = self.cipher.seal(&body_payload, &aad)?;
            flags |= FLAG_ENCRYPTED;
            sealed_prefix = Some(nonce);
            body_payload = ciphertext;
        }

        let header = FrameHeader {
            version: MESH_VERSION,
            msg_type: MsgType::Data,
            flags,
            ttl,
            origin,
            seqno,
        };

        let nonce_len = sealed_prefix.map(|_| NONCE_LEN).unwrap_or(0);
        let total = HEADER_LEN + DATA_BODY_MIN_LEN + nonce_len + body_payload.len();
        if total > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                len: total,
                max: MAX_FRAME_LEN,
            });
        }

        let mut out = Vec::with_capacity(total);
        header.encode_into(&mut out);
        out.extend_from_slice(dest.as_bytes());
        out.extend_from_slice(&data_seqno.to_be_bytes());
        if let Some(nonce) = sealed_prefix {
            out.extend_from_slice(&nonce);
        }
        out.extend_from_slice(&body_payload);
        Ok(out)
    }

    /// Split a raw frame into its header and untouched body bytes.
    pub fn decode_header(bytes: &[u8]) -> CodecResult<(FrameHeader, &[u8])> {
        let header = FrameHeader::decode(bytes)?;
        Ok((header, &bytes[HEADER_LEN..]))
    }

    /// Re-assemble a frame from a header and an untouched raw body.
    ///
    /// Used when forwarding: only the header changes, the body is relayed
    /// byte for byte.
    pub fn encode_raw(header: &FrameHeader, raw_body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + raw_body.len());
        header.encode_into(&mut out);
        out.extend_from_slice(raw_body);
        out
    }

    /// Recover the clear DATA body from a raw body, undoing sealing and
    /// compression as the header flags dictate.
    pub fn open_data(&self, header: &FrameHeader, raw_body: &[u8]) -> CodecResult<DataBody> {
        let (dest, data_seqno) = DataBody::peek(raw_body)?;
        let rest = &raw_body[DATA_BODY_MIN_LEN..];

        let mut payload: Vec<u8>;
        if header.is_encrypted() {
            if rest.len() < NONCE_LEN + 1 {
                return Err(CodecError::Truncated {
                    needed: NONCE_LEN + 1,
                    got: rest.len(),
                });
            }
            let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
            let aad = data_aad(&header.origin, &dest, data_seqno);
            payload = self.cipher.open(nonce, ciphertext, &aad)?;
        } else {
            payload = rest.to_vec();
        }

        if header.is_compressed() {
            payload = inflate(&payload)?;
        }

        Ok(DataBody {
            dest,
            data_seqno,
            payload,
        })
    }

    /// Decode a complete frame, returning a typed value.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Frame> {
        let (header, raw_body) = Self::decode_header(bytes)?;
        let body = match header.msg_type {
            MsgType::Ogm => FrameBody::Ogm(OgmBody::decode(raw_body)?),
            MsgType::Data => FrameBody::Data(self.open_data(&header, raw_body)?),
        };
        Ok(Frame { header, body })
    }
}

fn deflate(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CodecError::Decompression(format!("deflate: {}", e)))
}

fn inflate(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn origin() -> NodeId {
        NodeId::from_callsign("NOCALL-1").unwrap()
    }

    fn dest() -> NodeId {
        NodeId::from_callsign("KD9YQK-1").unwrap()
    }

    fn sealed_codec() -> FrameCodec {
        FrameCodec::new(
            DEFAULT_COMPRESS_THRESHOLD,
            PayloadCipher::new(true, Some(&[9u8; KEY_LEN])).unwrap(),
        )
    }

    #[test]
    fn test_ogm_roundtrip() {
        let body = OgmBody {
            prev_hop: origin(),
            metric: 3,
        };
        let bytes = FrameCodec::encode_ogm(origin(), 17, 5, &body);
        assert_eq!(bytes.len(), HEADER_LEN + OGM_BODY_LEN);

        let frame = FrameCodec::plain().decode(&bytes).unwrap();
        assert_eq!(frame.header.msg_type, MsgType::Ogm);
        assert_eq!(frame.header.ttl, 5);
        assert_eq!(frame.header.seqno, 17);
        assert_eq!(frame.body, FrameBody::Ogm(body));
    }

    #[test]
    fn test_data_roundtrip_payload_boundaries() {
        let codec = FrameCodec::plain();
        for size in [0usize, 1, 4096] {
            let payload = vec![0xA5u8; size];
            let bytes = codec
                .encode_data(origin(), 9, 8, dest(), 9, &payload)
                .unwrap();
            let frame = codec.decode(&bytes).unwrap();
            match frame.body {
                FrameBody::Data(data) => {
                    assert_eq!(data.dest, dest());
                    assert_eq!(data.data_seqno, 9);
                    assert_eq!(data.payload, payload, "size {}", size);
                }
                other => panic!("expected DATA, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_large_compressible_payload_roundtrip() {
        // 65519 bytes is the largest body a frame can carry; highly
        // repetitive content shrinks far below that on the wire.
        let codec = FrameCodec::plain();
        let payload = vec![b'x'; 65519];
        let bytes = codec
            .encode_data(origin(), 1, 8, dest(), 1, &payload)
            .unwrap();
        assert!(bytes.len() < payload.len());

        let (header, _) = FrameCodec::decode_header(&bytes).unwrap();
        assert!(header.is_compressed());

        let frame = codec.decode(&bytes).unwrap();
        match frame.body {
            FrameBody::Data(data) => assert_eq!(data.payload, payload),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[test]
    fn test_incompressible_large_payload_rejected() {
        let codec = FrameCodec::plain();
        let payload: Vec<u8> = (0..70_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        assert!(matches!(
            codec.encode_data(origin(), 1, 8, dest(), 1, &payload),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_compression_kept_only_when_shorter() {
        let codec = FrameCodec::plain();
        // Small random-ish payload above the threshold that deflate cannot
        // shrink; the flag must stay clear and the payload go out verbatim.
        let payload: Vec<u8> = (0..100u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let bytes = codec
            .encode_data(origin(), 2, 8, dest(), 2, &payload)
            .unwrap();
        let (header, raw_body) = FrameCodec::decode_header(&bytes).unwrap();
        assert!(!header.is_compressed());
        assert_eq!(&raw_body[DATA_BODY_MIN_LEN..], payload.as_slice());
    }

    #[test]
    fn test_compressed_flag_set_for_text() {
        let codec = FrameCodec::plain();
        let text = "CQ CQ CQ de NOCALL-1 ".repeat(100);
        let bytes = codec
            .encode_data(origin(), 3, 8, dest(), 3, text.as_bytes())
            .unwrap();
        let (header, _) = FrameCodec::decode_header(&bytes).unwrap();
        assert!(header.is_compressed());
        assert!(bytes.len() < HEADER_LEN + DATA_BODY_MIN_LEN + text.len());

        let frame = codec.decode(&bytes).unwrap();
        match frame.body {
            FrameBody::Data(data) => assert_eq!(data.payload, text.as_bytes()),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[test]
    fn test_sealed_roundtrip() {
        let codec = sealed_codec();
        let bytes = codec
            .encode_data(origin(), 4, 8, dest(), 4, b"private traffic")
            .unwrap();
        let (header, _) = FrameCodec::decode_header(&bytes).unwrap();
        assert!(header.is_encrypted());

        let frame = codec.decode(&bytes).unwrap();
        match frame.body {
            FrameBody::Data(data) => assert_eq!(data.payload, b"private traffic"),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[test]
    fn test_sealed_frame_unreadable_without_cipher() {
        let sealed = sealed_codec()
            .encode_data(origin(), 5, 8, dest(), 5, b"private traffic")
            .unwrap();
        assert!(matches!(
            FrameCodec::plain().decode(&sealed),
            Err(CodecError::EncryptionDisabled)
        ));
    }

    #[test]
    fn test_plain_codec_never_sets_encrypted_flag() {
        let bytes = FrameCodec::plain()
            .encode_data(origin(), 6, 8, dest(), 6, b"clear traffic")
            .unwrap();
        let (header, _) = FrameCodec::decode_header(&bytes).unwrap();
        assert!(!header.is_encrypted());
    }

    #[test]
    fn test_decode_rejects_short_and_bad_version() {
        assert!(matches!(
            FrameHeader::decode(&[1u8; 15]),
            Err(CodecError::Truncated { .. })
        ));

        let mut bytes = FrameCodec::encode_ogm(
            origin(),
            1,
            5,
            &OgmBody {
                prev_hop: origin(),
                metric: 0,
            },
        );
        bytes[0] = 99;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));

        bytes[0] = MESH_VERSION;
        bytes[1] = 7;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(CodecError::UnknownMsgType(7))
        ));
    }

    #[test]
    fn test_corrupt_compressed_payload_rejected() {
        let codec = FrameCodec::plain();
        let text = "hello hello hello hello hello hello hello hello hello hello";
        let mut bytes = codec
            .encode_data(origin(), 7, 8, dest(), 7, text.as_bytes())
            .unwrap();
        assert!(FrameHeader::decode(&bytes).unwrap().is_compressed());
        // Stomp the deflate stream
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        bytes[last - 1] ^= 0xFF;
        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::Decompression(_))
        ));
    }

    #[test]
    fn test_forward_reencode_preserves_body() {
        let codec = FrameCodec::plain();
        let bytes = codec
            .encode_data(origin(), 8, 8, dest(), 8, b"relay me")
            .unwrap();
        let (mut header, raw_body) = FrameCodec::decode_header(&bytes).unwrap();
        header.ttl -= 1;
        let forwarded = FrameCodec::encode_raw(&header, raw_body);

        let (fwd_header, fwd_body) = FrameCodec::decode_header(&forwarded).unwrap();
        assert_eq!(fwd_header.ttl, 7);
        assert_eq!(fwd_header.origin, origin());
        assert_eq!(fwd_body, raw_body);
    }
}
