//! Optional AEAD sealing for DATA payloads.
//!
//! Off by default and a hard error to use while off. On amateur bands this
//! stays disabled; the wired backbone may opt in with an explicit key.
//! AES-256-GCM with a random 12-byte nonce; the associated data binds the
//! sealed payload to its origin, destination and data seqno so a ciphertext
//! cannot be replayed under a different frame identity.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fmt;

use crate::error::{CodecError, CodecResult};
use crate::node_id::{NodeId, NODE_ID_LEN};

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length carried on the wire before the ciphertext.
pub const NONCE_LEN: usize = 12;

/// Associated data for a DATA payload: origin, destination, data seqno.
pub fn data_aad(origin: &NodeId, dest: &NodeId, data_seqno: u32) -> [u8; NODE_ID_LEN * 2 + 4] {
    let mut aad = [0u8; NODE_ID_LEN * 2 + 4];
    aad[..NODE_ID_LEN].copy_from_slice(origin.as_bytes());
    aad[NODE_ID_LEN..NODE_ID_LEN * 2].copy_from_slice(dest.as_bytes());
    aad[NODE_ID_LEN * 2..].copy_from_slice(&data_seqno.to_be_bytes());
    aad
}

/// Payload cipher; a pass-through error source unless explicitly enabled.
pub struct PayloadCipher {
    cipher: Option<Aes256Gcm>,
}

impl PayloadCipher {
    /// A cipher that refuses all seal and open requests.
    pub fn disabled() -> Self {
        PayloadCipher { cipher: None }
    }

    /// Build from the security configuration.
    ///
    /// Returns a disabled cipher when `enabled` is false. When enabled, the
    /// key must be exactly 32 bytes.
    pub fn new(enabled: bool, key: Option<&[u8]>) -> CodecResult<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }
        let key = key.ok_or_else(|| {
            CodecError::Crypto("encryption enabled but no key configured".to_string())
        })?;
        if key.len() != KEY_LEN {
            return Err(CodecError::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CodecError::Crypto(format!("bad key: {}", e)))?;
        Ok(PayloadCipher {
            cipher: Some(cipher),
        })
    }

    /// Whether sealing is available.
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a payload. Returns the nonce and the ciphertext.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> CodecResult<([u8; NONCE_LEN], Vec<u8>)> {
        let cipher = self.cipher.as_ref().ok_or(CodecError::EncryptionDisabled)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CodecError::Crypto("seal failed".to_string()))?;
        Ok((nonce, ciphertext))
    }

    /// Open a sealed payload.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> CodecResult<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(CodecError::EncryptionDisabled)?;
        if nonce.len() != NONCE_LEN {
            return Err(CodecError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CodecError::Crypto("open failed: bad key, nonce or tag".to_string()))
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
