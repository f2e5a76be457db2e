//! Transform pipeline: compress → seal → hash, and the reverse
//!
//! One `TransformPipeline` owns the key material of every session it has
//! initialized. Keys never leave it: callers get a `SessionKeyInfo` carrying
//! only a fingerprint. Sessions are independent; the session map is only
//! write-locked to add or remove a session.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use chunkseal_chunks::{compress, decompress, hash_bytes, Codec, Compressed};
use chunkseal_core::config::TransformConfig;
use chunkseal_core::types::compression_ratio;
use chunkseal_core::{now_millis, AeadAlgorithm, Digest, HashAlgorithm, SealError, SealResult};

use crate::keys::{generate_session_key, SessionKey};
use crate::seal::{open, seal};

/// Public facts about a session's key. The key itself is never exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionKeyInfo {
    pub session_id: String,
    pub key_fingerprint: String,
    pub algorithm: AeadAlgorithm,
    /// Unix milliseconds
    pub created_at: u64,
}

/// Result of `process` for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    pub session_id: String,
    pub sequence: u64,
    /// Codec that produced the payload (`None` after a raw fallback)
    pub codec: Codec,
    pub original_size: u64,
    pub compressed_size: u64,
    pub encrypted_size: u64,
    pub compression_ratio: f64,
    pub hash_algorithm: HashAlgorithm,
    pub hash_original: Digest,
    pub hash_compressed: Digest,
    pub hash_encrypted: Digest,
    pub compression_micros: u64,
    pub encryption_micros: u64,
    /// `[nonce][ciphertext][tag]`, ready for the blob store
    pub sealed: Vec<u8>,
}

/// An authenticated, still-compressed chunk payload.
#[derive(Debug)]
pub struct OpenedChunk {
    pub codec: Codec,
    pub payload: Vec<u8>,
}

impl OpenedChunk {
    pub fn decompress(&self) -> SealResult<Vec<u8>> {
        decompress(&self.payload, self.codec)
    }
}

/// Per-session running counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub chunks_processed: u64,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    pub total_encrypted_size: u64,
    pub avg_compression_ratio: f64,
    pub total_compression_micros: u64,
    pub total_encryption_micros: u64,
    pub raw_fallbacks: u64,
}

impl SessionStats {
    pub fn avg_compression_micros(&self) -> f64 {
        if self.chunks_processed == 0 {
            return 0.0;
        }
        self.total_compression_micros as f64 / self.chunks_processed as f64
    }

    pub fn avg_encryption_micros(&self) -> f64 {
        if self.chunks_processed == 0 {
            return 0.0;
        }
        self.total_encryption_micros as f64 / self.chunks_processed as f64
    }

    fn record(&mut self, meta: &ChunkMetadata, fallback: bool) {
        let n = self.chunks_processed as f64;
        self.avg_compression_ratio =
            (self.avg_compression_ratio * n + meta.compression_ratio) / (n + 1.0);
        self.chunks_processed += 1;
        self.total_original_size += meta.original_size;
        self.total_compressed_size += meta.compressed_size;
        self.total_encrypted_size += meta.encrypted_size;
        self.total_compression_micros += meta.compression_micros;
        self.total_encryption_micros += meta.encryption_micros;
        if fallback {
            self.raw_fallbacks += 1;
        }
    }
}

struct SessionContext {
    key: SessionKey,
    info: SessionKeyInfo,
    stats: Mutex<SessionStats>,
}

pub struct TransformPipeline {
    settings: TransformConfig,
    sessions: RwLock<HashMap<String, SessionContext>>,
}

impl TransformPipeline {
    pub fn new(settings: TransformConfig) -> Self {
        Self {
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &TransformConfig {
        &self.settings
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.settings.hash
    }

    /// Generate a fresh key for `session_id`.
    ///
    /// Fails with `SessionExists` if the session already holds a key and with
    /// `KeyGeneration` if the entropy source fails.
    pub fn init_session(&self, session_id: &str) -> SealResult<SessionKeyInfo> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(session_id) {
            return Err(SealError::SessionExists(session_id.to_string()));
        }

        let key = generate_session_key()?;
        let info = SessionKeyInfo {
            session_id: session_id.to_string(),
            key_fingerprint: key.fingerprint(),
            algorithm: self.settings.aead,
            created_at: now_millis(),
        };
        sessions.insert(
            session_id.to_string(),
            SessionContext {
                key,
                info: info.clone(),
                stats: Mutex::new(SessionStats::default()),
            },
        );

        info!(
            session = %session_id,
            key = %info.key_fingerprint,
            aead = %info.algorithm,
            "session key initialized"
        );
        Ok(info)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn session_info(&self, session_id: &str) -> SealResult<SessionKeyInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .map(|ctx| ctx.info.clone())
            .ok_or_else(|| SealError::UnknownSession(session_id.to_string()))
    }

    /// Compress, seal, and hash one raw chunk.
    ///
    /// Nothing is recorded unless every stage succeeds.
    pub fn process(
        &self,
        session_id: &str,
        raw: &[u8],
        sequence: u64,
    ) -> SealResult<ChunkMetadata> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = sessions
            .get(session_id)
            .ok_or_else(|| SealError::UnknownSession(session_id.to_string()))?;
        let hash_algorithm = self.settings.hash;

        let hash_original = hash_bytes(hash_algorithm, raw);

        let started = Instant::now();
        let (compressed, fallback) = match compress(raw, &self.settings.compression) {
            Ok(c) => (c, false),
            Err(e) if self.settings.store_raw_on_compression_failure => {
                warn!(
                    session = %session_id,
                    sequence,
                    "compression failed, storing raw: {e}"
                );
                let stored = Compressed {
                    codec: Codec::None,
                    data: raw.to_vec(),
                };
                (stored, true)
            }
            Err(e) => return Err(e),
        };
        let compression_micros = started.elapsed().as_micros() as u64;
        let hash_compressed = hash_bytes(hash_algorithm, &compressed.data);

        let mut framed = Vec::with_capacity(1 + compressed.data.len());
        framed.push(compressed.codec.tag());
        framed.extend_from_slice(&compressed.data);

        let started = Instant::now();
        let sealed = seal(self.settings.aead, &ctx.key, session_id, &framed)?;
        let encryption_micros = started.elapsed().as_micros() as u64;
        let hash_encrypted = hash_bytes(hash_algorithm, &sealed);

        let meta = ChunkMetadata {
            session_id: session_id.to_string(),
            sequence,
            codec: compressed.codec,
            original_size: raw.len() as u64,
            compressed_size: compressed.data.len() as u64,
            encrypted_size: sealed.len() as u64,
            compression_ratio: compression_ratio(raw.len() as u64, compressed.data.len() as u64),
            hash_algorithm,
            hash_original,
            hash_compressed,
            hash_encrypted,
            compression_micros,
            encryption_micros,
            sealed,
        };

        ctx.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&meta, fallback);

        debug!(
            session = %session_id,
            sequence,
            original = meta.original_size,
            compressed = meta.compressed_size,
            encrypted = meta.encrypted_size,
            leaf = %meta.hash_encrypted.short(),
            "chunk transformed"
        );
        Ok(meta)
    }

    /// Authenticate and decrypt a sealed chunk, leaving the payload compressed.
    pub fn open_payload(&self, session_id: &str, sealed: &[u8]) -> SealResult<OpenedChunk> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = sessions
            .get(session_id)
            .ok_or_else(|| SealError::UnknownSession(session_id.to_string()))?;

        let mut framed = open(self.settings.aead, &ctx.key, session_id, sealed)?;
        if framed.is_empty() {
            return Err(SealError::Decryption {
                session_id: session_id.to_string(),
                reason: "sealed payload is missing its codec tag".into(),
            });
        }
        let codec = Codec::from_tag(framed[0])?;
        framed.remove(0);

        Ok(OpenedChunk {
            codec,
            payload: framed,
        })
    }

    /// Recover the raw bytes of a sealed chunk.
    pub fn reverse(&self, session_id: &str, sealed: &[u8]) -> SealResult<Vec<u8>> {
        self.open_payload(session_id, sealed)?.decompress()
    }

    /// Snapshot of the running counters for `session_id`.
    pub fn session_statistics(&self, session_id: &str) -> SealResult<SessionStats> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = sessions
            .get(session_id)
            .ok_or_else(|| SealError::UnknownSession(session_id.to_string()))?;
        let stats = ctx.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(stats)
    }

    /// Overwrite and drop the session key and its counters.
    ///
    /// Returns false if the session held no key.
    pub fn cleanup_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        match removed {
            Some(mut ctx) => {
                ctx.key.wipe();
                info!(
                    session = %session_id,
                    key = %ctx.info.key_fingerprint,
                    "session key discarded"
                );
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("settings", &self.settings)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkseal_core::CompressionAlgorithm;
    use proptest::prelude::*;

    fn pipeline(compression: CompressionAlgorithm, aead: AeadAlgorithm) -> TransformPipeline {
        TransformPipeline::new(TransformConfig {
            compression,
            aead,
            ..TransformConfig::default()
        })
    }

    fn configs() -> Vec<(CompressionAlgorithm, AeadAlgorithm)> {
        let mut out = Vec::new();
        for c in [
            CompressionAlgorithm::Gzip { level: 6 },
            CompressionAlgorithm::Zstd { level: 3 },
            CompressionAlgorithm::None,
        ] {
            for a in [
                AeadAlgorithm::ChaCha20Poly1305,
                AeadAlgorithm::XChaCha20Poly1305,
                AeadAlgorithm::Aes256Gcm,
            ] {
                out.push((c, a));
            }
        }
        out
    }

    #[test]
    fn test_init_twice_fails() {
        let p = TransformPipeline::new(TransformConfig::default());
        let info = p.init_session("s1").unwrap();
        assert_eq!(info.session_id, "s1");
        assert_eq!(info.key_fingerprint.len(), 16);
        assert!(matches!(p.init_session("s1"), Err(SealError::SessionExists(_))));
    }

    #[test]
    fn test_unknown_session() {
        let p = TransformPipeline::new(TransformConfig::default());
        assert!(matches!(p.process("nope", b"x", 0), Err(SealError::UnknownSession(_))));
        assert!(matches!(p.reverse("nope", b"x"), Err(SealError::UnknownSession(_))));
    }

    #[test]
    fn test_roundtrip_all_configs() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for (c, a) in configs() {
            let p = pipeline(c, a);
            p.init_session("s1").unwrap();
            let meta = p.process("s1", &data, 0).unwrap();
            assert_eq!(meta.original_size, 5000);
            assert_eq!(meta.encrypted_size, meta.sealed.len() as u64);
            assert_eq!(
                meta.encrypted_size,
                (a.nonce_size() + 1) as u64 + meta.compressed_size + a.tag_size() as u64
            );
            assert_eq!(p.reverse("s1", &meta.sealed).unwrap(), data, "{c:?}/{a:?}");
        }
    }

    #[test]
    fn test_empty_chunk_ratio_is_one() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let meta = p.process("s1", b"", 0).unwrap();
        assert_eq!(meta.original_size, 0);
        assert_eq!(meta.compression_ratio, 1.0);
        assert!(p.reverse("s1", &meta.sealed).unwrap().is_empty());
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let meta = p.process("s1", b"tamper-evident session bytes", 0).unwrap();

        for byte in 0..meta.sealed.len() {
            for bit in 0..8 {
                let mut tampered = meta.sealed.clone();
                tampered[byte] ^= 1 << bit;
                let result = p.reverse("s1", &tampered);
                assert!(
                    matches!(result, Err(SealError::Authentication { .. })),
                    "flip at byte {byte} bit {bit} was not detected"
                );
            }
        }
    }

    #[test]
    fn test_hash_determinism_with_fresh_nonce() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let data = vec![42u8; 2048];
        let a = p.process("s1", &data, 0).unwrap();
        let b = p.process("s1", &data, 1).unwrap();

        assert_eq!(a.hash_original, b.hash_original);
        assert_eq!(a.hash_compressed, b.hash_compressed);
        assert_ne!(a.hash_encrypted, b.hash_encrypted);
        assert_ne!(a.sealed, b.sealed);
    }

    #[test]
    fn test_hash_original_matches_content_hash() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let meta = p.process("s1", b"abc", 0).unwrap();
        assert_eq!(meta.hash_original, hash_bytes(HashAlgorithm::Blake3, b"abc"));
        assert_eq!(meta.hash_encrypted, hash_bytes(HashAlgorithm::Blake3, &meta.sealed));
    }

    #[test]
    fn test_open_payload_exposes_compressed_stage() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let meta = p.process("s1", &[9u8; 4096], 0).unwrap();
        let opened = p.open_payload("s1", &meta.sealed).unwrap();
        assert_eq!(opened.codec, Codec::Gzip);
        assert_eq!(hash_bytes(HashAlgorithm::Blake3, &opened.payload), meta.hash_compressed);
        assert_eq!(opened.decompress().unwrap(), vec![9u8; 4096]);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("a").unwrap();
        p.init_session("b").unwrap();
        let meta = p.process("a", b"only for a", 0).unwrap();
        assert!(p.reverse("b", &meta.sealed).is_err());
    }

    #[test]
    fn test_statistics_accumulate() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        p.process("s1", &[0u8; 1000], 0).unwrap();
        p.process("s1", &[1u8; 1000], 1).unwrap();

        let stats = p.session_statistics("s1").unwrap();
        assert_eq!(stats.chunks_processed, 2);
        assert_eq!(stats.total_original_size, 2000);
        assert!(stats.avg_compression_ratio > 1.0);
        assert_eq!(stats.raw_fallbacks, 0);
    }

    fn failing_codec(store_raw: bool) -> TransformPipeline {
        TransformPipeline::new(TransformConfig {
            compression: CompressionAlgorithm::Gzip { level: 42 },
            store_raw_on_compression_failure: store_raw,
            ..TransformConfig::default()
        })
    }

    #[test]
    fn test_compression_failure_falls_back_to_raw() {
        let p = failing_codec(true);
        p.init_session("s1").unwrap();
        let data = vec![5u8; 3000];
        let meta = p.process("s1", &data, 0).unwrap();

        assert_eq!(meta.codec, Codec::None);
        assert_eq!(meta.compressed_size, meta.original_size);
        assert_eq!(meta.compression_ratio, 1.0);
        assert_eq!(meta.hash_compressed, meta.hash_original);
        assert_eq!(p.reverse("s1", &meta.sealed).unwrap(), data);

        let stats = p.session_statistics("s1").unwrap();
        assert_eq!(stats.raw_fallbacks, 1);
        assert_eq!(stats.chunks_processed, 1);
    }

    #[test]
    fn test_compression_failure_is_fatal_without_fallback() {
        let p = failing_codec(false);
        p.init_session("s1").unwrap();
        let result = p.process("s1", &[5u8; 3000], 0);
        assert!(matches!(result, Err(SealError::Compression(_))));

        let stats = p.session_statistics("s1").unwrap();
        assert_eq!(stats.chunks_processed, 0);
        assert_eq!(stats.raw_fallbacks, 0);
    }

    #[test]
    fn test_cleanup_discards_key_and_stats() {
        let p = TransformPipeline::new(TransformConfig::default());
        p.init_session("s1").unwrap();
        let meta = p.process("s1", b"bytes", 0).unwrap();

        assert!(p.cleanup_session("s1"));
        assert!(!p.cleanup_session("s1"));
        assert_eq!(p.active_sessions(), 0);
        assert!(matches!(p.reverse("s1", &meta.sealed), Err(SealError::UnknownSession(_))));
        assert!(p.session_statistics("s1").is_err());

        // A re-initialized session gets a different key
        p.init_session("s1").unwrap();
        assert!(matches!(
            p.reverse("s1", &meta.sealed),
            Err(SealError::Authentication { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_reverse_inverts_process(
            data in proptest::collection::vec(any::<u8>(), 0..=16384),
            which in 0usize..9,
        ) {
            let (c, a) = configs()[which];
            let p = pipeline(c, a);
            p.init_session("prop").unwrap();
            let meta = p.process("prop", &data, 0).unwrap();
            prop_assert_eq!(p.reverse("prop", &meta.sealed).unwrap(), data);
        }
    }
}
