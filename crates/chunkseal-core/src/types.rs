use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Width of every digest produced by the supported hash algorithms.
pub const DIGEST_SIZE: usize = 32;

/// A 256-bit content digest, serialized as 64 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// The all-zero digest (root of an empty Merkle tree)
    pub const ZERO: Digest = Digest([0u8; DIGEST_SIZE]);

    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string.
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let mut bytes = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| anyhow::anyhow!("invalid digest hex '{s}': {e}"))?;
        Ok(Self(bytes))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Content hash algorithm used for chunk digests and Merkle nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Blake3 => f.write_str("blake3"),
            HashAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

/// Compression codec applied to a chunk before encryption.
///
/// Levels are fixed per configuration; decompression never needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// DEFLATE in a gzip container (level 0..=9)
    Gzip { level: u32 },
    /// Zstandard (level 1..=22)
    Zstd { level: i32 },
    /// Store the bytes unchanged
    None,
}

impl CompressionAlgorithm {
    pub const DEFAULT_GZIP_LEVEL: u32 = 6;
    pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip { .. } => "gzip",
            CompressionAlgorithm::Zstd { .. } => "zstd",
            CompressionAlgorithm::None => "none",
        }
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Gzip {
            level: Self::DEFAULT_GZIP_LEVEL,
        }
    }
}

/// Authenticated encryption cipher used to seal chunks.
///
/// All variants take a 256-bit key; nonce width differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305, 96-bit nonce
    #[default]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305, 192-bit nonce
    XChaCha20Poly1305,
    /// AES-256-GCM, 96-bit nonce
    Aes256Gcm,
}

impl AeadAlgorithm {
    pub fn nonce_size(&self) -> usize {
        match self {
            AeadAlgorithm::ChaCha20Poly1305 | AeadAlgorithm::Aes256Gcm => 12,
            AeadAlgorithm::XChaCha20Poly1305 => 24,
        }
    }

    /// Every supported cipher appends a 128-bit tag.
    pub fn tag_size(&self) -> usize {
        16
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AeadAlgorithm::ChaCha20Poly1305 => f.write_str("chacha20poly1305"),
            AeadAlgorithm::XChaCha20Poly1305 => f.write_str("xchacha20poly1305"),
            AeadAlgorithm::Aes256Gcm => f.write_str("aes256gcm"),
        }
    }
}

/// The step of the reverse pipeline at which an integrity check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStage {
    /// Stored blob bytes do not hash to `hash_encrypted`
    EncryptedHash,
    /// AEAD tag did not verify
    Authentication,
    /// Decrypted payload does not hash to `hash_compressed`
    CompressedHash,
    /// Payload could not be decompressed
    Decompression,
    /// Recovered bytes do not hash to `hash_original`
    OriginalHash,
    /// Leaf did not prove into the Merkle root
    MerkleProof,
}

impl fmt::Display for IntegrityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntegrityStage::EncryptedHash => "encrypted_hash",
            IntegrityStage::Authentication => "authentication",
            IntegrityStage::CompressedHash => "compressed_hash",
            IntegrityStage::Decompression => "decompression",
            IntegrityStage::OriginalHash => "original_hash",
            IntegrityStage::MerkleProof => "merkle_proof",
        };
        f.write_str(s)
    }
}

/// Persisted metadata for one chunk of a session.
///
/// Written once after the transformed bytes are stored; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub session_id: String,
    /// 0-based, dense within a session
    pub sequence: u64,
    pub original_size: u64,
    pub compressed_size: u64,
    pub encrypted_size: u64,
    /// original_size / compressed_size (1.0 for empty chunks)
    pub compression_ratio: f64,
    pub hash_algorithm: HashAlgorithm,
    pub hash_original: Digest,
    pub hash_compressed: Digest,
    /// Digest of the nonce+ciphertext framing; this is the Merkle leaf
    pub hash_encrypted: Digest,
    /// Unix milliseconds
    pub created_at: u64,
    /// Blob store key holding the sealed bytes
    pub storage_locator: String,
}

/// Aggregate metrics over every persisted chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStatistics {
    pub total_chunks: u64,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    pub total_encrypted_size: u64,
    pub avg_compression_ratio: f64,
    pub unique_sessions: u64,
    pub space_saved_bytes: i64,
    /// Registered sessions not archived
    #[serde(default)]
    pub active_sessions: u64,
    #[serde(default)]
    pub archived_sessions: u64,
}

impl ChunkStatistics {
    /// Aggregate statistics from an iterator of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ChunkRecord>) -> Self {
        let mut stats = ChunkStatistics::default();
        let mut ratio_sum = 0.0;
        let mut sessions = std::collections::HashSet::new();

        for record in records {
            stats.total_chunks += 1;
            stats.total_original_size += record.original_size;
            stats.total_compressed_size += record.compressed_size;
            stats.total_encrypted_size += record.encrypted_size;
            ratio_sum += record.compression_ratio;
            sessions.insert(record.session_id.as_str());
        }

        if stats.total_chunks > 0 {
            stats.avg_compression_ratio = ratio_sum / stats.total_chunks as f64;
        }
        stats.unique_sessions = sessions.len() as u64;
        stats.space_saved_bytes =
            stats.total_original_size as i64 - stats.total_compressed_size as i64;
        stats
    }
}

/// Compression ratio as original / compressed, defined as 1.0 for empty input.
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 || compressed_size == 0 {
        1.0
    } else {
        original_size as f64 / compressed_size as f64
    }
}
