//! Length-prefix stream framing.
//!
//! Every transport carries mesh frames as `u16_be_length || bytes`, which
//! bounds a single frame to 65535 bytes. The buffer here is pure byte
//! shuffling so it can be tested without sockets; the connection workers
//! feed it from the stream and drain complete frames.

use bytes::{Buf, BytesMut};

use crate::error::{LinkError, LinkResult};

/// Bytes of length prefix on the wire.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest frame the prefix can describe.
pub const MAX_WIRE_FRAME: usize = u16::MAX as usize;

/// Prefix a payload for transmission.
pub fn frame_for_wire(payload: &[u8]) -> LinkResult<Vec<u8>> {
    if payload.len() > MAX_WIRE_FRAME {
        return Err(LinkError::FrameTooLarge {
            len: payload.len(),
        });
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Reassembly buffer for inbound stream bytes.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw stream bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Remove and return the next complete frame, if one has fully arrived.
    /// Zero-length prefixes are discarded.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_LEN {
                return None;
            }
            let frame_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if frame_len == 0 {
                self.buf.advance(LENGTH_PREFIX_LEN);
                continue;
            }
            if self.buf.len() < LENGTH_PREFIX_LEN + frame_len {
                return None;
            }
            self.buf.advance(LENGTH_PREFIX_LEN);
            let frame = self.buf.split_to(frame_len);
            return Some(frame.to_vec());
        }
    }

    /// Drop any partially accumulated bytes, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_boundary_sizes() {
        for size in [1usize, 4096, 65519, MAX_WIRE_FRAME] {
            let payload = vec![0x5Au8; size];
            let wire = frame_for_wire(&payload).unwrap();
            assert_eq!(wire.len(), size + LENGTH_PREFIX_LEN);

            let mut buffer = FrameBuffer::new();
            buffer.extend(&wire);
            assert_eq!(buffer.next_frame().unwrap(), payload);
            assert!(buffer.next_frame().is_none());
        }
    }

    #[test]
    fn test_oversize_rejected() {
        let payload = vec![0u8; MAX_WIRE_FRAME + 1];
        assert!(matches!(
            frame_for_wire(&payload),
            Err(LinkError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_then_complete() {
        let wire = frame_for_wire(b"split delivery").unwrap();
        let mut buffer = FrameBuffer::new();

        buffer.extend(&wire[..1]);
        assert!(buffer.next_frame().is_none());
        buffer.extend(&wire[1..5]);
        assert!(buffer.next_frame().is_none());
        buffer.extend(&wire[5..]);
        assert_eq!(buffer.next_frame().unwrap(), b"split delivery");
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut chunk = frame_for_wire(b"one").unwrap();
        chunk.extend(frame_for_wire(b"two").unwrap());
        chunk.extend(frame_for_wire(b"three").unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&chunk);
        assert_eq!(buffer.next_frame().unwrap(), b"one");
        assert_eq!(buffer.next_frame().unwrap(), b"two");
        assert_eq!(buffer.next_frame().unwrap(), b"three");
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_zero_length_prefix_skipped() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&[0, 0]);
        buffer.extend(&frame_for_wire(b"after empty").unwrap());
        assert_eq!(buffer.next_frame().unwrap(), b"after empty");
    }

    #[test]
    fn test_clear_discards_partial() {
        let wire = frame_for_wire(b"stale").unwrap();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&wire[..3]);
        buffer.clear();
        buffer.extend(&frame_for_wire(b"fresh").unwrap());
        assert_eq!(buffer.next_frame().unwrap(), b"fresh");
    }
}
