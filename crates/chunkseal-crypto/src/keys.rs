//! Session key material

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use zeroize::Zeroize;

use chunkseal_core::{SealError, SealResult};

use crate::KEY_SIZE;

/// A per-session 256-bit encryption key. Zeroized on drop.
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Non-secret identifier for logs and session info: first 8 bytes of
    /// SHA-256 over a domain tag and the key, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"chunkseal-key-fingerprint");
        hasher.update(self.bytes);
        hex::encode(&hasher.finalize()[..8])
    }

    /// Overwrite the key in place.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Generate a random 256-bit session key from the OS entropy source.
pub fn generate_session_key() -> SealResult<SessionKey> {
    let mut bytes = [0u8; KEY_SIZE];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        bytes.zeroize();
        return Err(SealError::KeyGeneration(format!("OS entropy source: {e}")));
    }
    Ok(SessionKey::from_bytes(bytes))
}
