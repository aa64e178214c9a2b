use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("shared key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("shared key must be 32 bytes, got {0}")]
    Length(usize),
}

/// 256-bit symmetric key shared by the server and every client.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = BASE64.decode(encoded.trim())?;
        let len = bytes.len();
        let key: [u8; 32] = bytes.try_into().map_err(|_| KeyError::Length(len))?;
        Ok(Self(key))
    }

    /// Encode the key to base64 for handing to clients.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Short identifier safe to log: first 8 bytes of SHA-256(key), hex.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({})", self.fingerprint())
    }
}
