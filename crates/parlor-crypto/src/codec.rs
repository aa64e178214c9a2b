use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::keys::SharedKey;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Size of the frame body `encode` produces for `plaintext_len` bytes of JSON.
pub const fn sealed_len(plaintext_len: usize) -> usize {
    (NONCE_LEN + plaintext_len + TAG_LEN).div_ceil(3) * 4
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (corrupt frame or wrong key)")]
    Decrypt,
    #[error("frame is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Turns envelopes into sealed frame bodies and back.
///
/// Body layout: base64(nonce(12) || ciphertext || tag(16)).
#[derive(Clone)]
pub struct FrameCodec {
    cipher: Aes256Gcm,
}

impl FrameCodec {
    pub fn new(key: &SharedKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Serialize, encrypt and text-encode one value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        let plaintext = serde_json::to_vec(value)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| CodecError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(Bytes::from(BASE64.encode(sealed)))
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T, CodecError> {
        let sealed = BASE64.decode(frame)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CodecError::Truncated(sealed.len()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CodecError::Decrypt)?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
