//! AEAD chunk sealing
//!
//! Sealed chunk format (binary):
//! ```text
//! [nonce: 12 or 24 bytes][N bytes: ciphertext][16 bytes: tag]
//! AAD = session_id (UTF-8 bytes)
//! ```
//!
//! The AAD binds each chunk to its session, so a chunk copied into another
//! session's storage fails authentication there.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Nonce, Payload};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use rand::RngCore;

use chunkseal_core::{AeadAlgorithm, SealError, SealResult};

use crate::keys::SessionKey;

/// Seal `plaintext` under the session key with a fresh random nonce.
///
/// Returns `[nonce][ciphertext][tag]`.
pub fn seal(
    algorithm: AeadAlgorithm,
    key: &SessionKey,
    session_id: &str,
    plaintext: &[u8],
) -> SealResult<Vec<u8>> {
    let mut nonce = vec![0u8; algorithm.nonce_size()];
    rand::thread_rng().fill_bytes(&mut nonce);

    let aad = session_id.as_bytes();
    let ciphertext = match algorithm {
        AeadAlgorithm::ChaCha20Poly1305 => {
            encrypt_with::<ChaCha20Poly1305>(key, &nonce, aad, plaintext)
        }
        AeadAlgorithm::XChaCha20Poly1305 => {
            encrypt_with::<XChaCha20Poly1305>(key, &nonce, aad, plaintext)
        }
        AeadAlgorithm::Aes256Gcm => encrypt_with::<Aes256Gcm>(key, &nonce, aad, plaintext),
    }
    .map_err(|reason| SealError::Encryption {
        session_id: session_id.to_string(),
        reason,
    })?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed chunk produced by [`seal`].
///
/// A tag that does not verify is reported as `Authentication`: the key,
/// nonce, ciphertext, or session binding was altered.
pub fn open(
    algorithm: AeadAlgorithm,
    key: &SessionKey,
    session_id: &str,
    sealed: &[u8],
) -> SealResult<Vec<u8>> {
    let nonce_size = algorithm.nonce_size();
    let minimum = nonce_size + algorithm.tag_size();
    if sealed.len() < minimum {
        return Err(SealError::Decryption {
            session_id: session_id.to_string(),
            reason: format!(
                "sealed chunk too short: {} bytes (minimum {minimum})",
                sealed.len()
            ),
        });
    }

    let (nonce, ciphertext) = sealed.split_at(nonce_size);
    let aad = session_id.as_bytes();
    let opened = match algorithm {
        AeadAlgorithm::ChaCha20Poly1305 => {
            decrypt_with::<ChaCha20Poly1305>(key, nonce, aad, ciphertext)
        }
        AeadAlgorithm::XChaCha20Poly1305 => {
            decrypt_with::<XChaCha20Poly1305>(key, nonce, aad, ciphertext)
        }
        AeadAlgorithm::Aes256Gcm => decrypt_with::<Aes256Gcm>(key, nonce, aad, ciphertext),
    };

    opened.ok_or_else(|| SealError::Authentication {
        session_id: session_id.to_string(),
    })
}

fn encrypt_with<C: Aead + KeyInit>(
    key: &SessionKey,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>, String> {
    let cipher =
        C::new_from_slice(key.as_bytes()).map_err(|e| format!("cipher init failed: {e}"))?;
    cipher
        .encrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|e| format!("AEAD seal failed: {e}"))
}

fn decrypt_with<C: Aead + KeyInit>(
    key: &SessionKey,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Option<Vec<u8>> {
    let cipher = C::new_from_slice(key.as_bytes()).ok()?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_session_key;

    const ALL: [AeadAlgorithm; 3] = [
        AeadAlgorithm::ChaCha20Poly1305,
        AeadAlgorithm::XChaCha20Poly1305,
        AeadAlgorithm::Aes256Gcm,
    ];

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_session_key().unwrap();
        for alg in ALL {
            let sealed = seal(alg, &key, "s1", b"hello, sealed world!").unwrap();
            let opened = open(alg, &key, "s1", &sealed).unwrap();
            assert_eq!(opened, b"hello, sealed world!");
        }
    }

    #[test]
    fn test_seal_open_empty() {
        let key = generate_session_key().unwrap();
        for alg in ALL {
            let sealed = seal(alg, &key, "s1", b"").unwrap();
            assert_eq!(sealed.len(), alg.nonce_size() + alg.tag_size());
            assert!(open(alg, &key, "s1", &sealed).unwrap().is_empty());
        }
    }

    #[test]
    fn test_sealed_size() {
        let key = generate_session_key().unwrap();
        let sealed = seal(AeadAlgorithm::ChaCha20Poly1305, &key, "s1", &[0u8; 1000]).unwrap();
        // nonce (12) + plaintext (1000) + tag (16)
        assert_eq!(sealed.len(), 12 + 1000 + 16);
    }

    #[test]
    fn test_open_wrong_key() {
        let key1 = generate_session_key().unwrap();
        let key2 = generate_session_key().unwrap();
        let sealed = seal(AeadAlgorithm::default(), &key1, "s1", b"secret").unwrap();
        let result = open(AeadAlgorithm::default(), &key2, "s1", &sealed);
        assert!(matches!(result, Err(SealError::Authentication { .. })));
    }

    #[test]
    fn test_open_wrong_session_binding() {
        let key = generate_session_key().unwrap();
        let sealed = seal(AeadAlgorithm::default(), &key, "session-a", b"secret").unwrap();
        let result = open(AeadAlgorithm::default(), &key, "session-b", &sealed);
        assert!(
            matches!(result, Err(SealError::Authentication { .. })),
            "wrong session id must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = generate_session_key().unwrap();
        let mut sealed = seal(AeadAlgorithm::default(), &key, "s1", b"secret").unwrap();
        sealed[0] ^= 0x01;
        assert!(open(AeadAlgorithm::default(), &key, "s1", &sealed).is_err());
    }

    #[test]
    fn test_truncated_is_decryption_error() {
        let key = generate_session_key().unwrap();
        let result = open(AeadAlgorithm::default(), &key, "s1", &[0u8; 10]);
        assert!(matches!(result, Err(SealError::Decryption { .. })));
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = generate_session_key().unwrap();
        let a = seal(AeadAlgorithm::default(), &key, "s1", b"same").unwrap();
        let b = seal(AeadAlgorithm::default(), &key, "s1", b"same").unwrap();
        assert_ne!(a, b);
    }
}
