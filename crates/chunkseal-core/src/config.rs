use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SealError, SealResult};
use crate::types::{AeadAlgorithm, CompressionAlgorithm, HashAlgorithm};

/// Top-level configuration (loaded from chunkseal.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    pub chunking: ChunkingConfig,
    pub transform: TransformConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum raw bytes per chunk (default: 16 MiB)
    pub max_chunk_size: usize,
}

/// Per-chunk compress → encrypt → hash settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// AEAD cipher (default: chacha20poly1305)
    pub aead: AeadAlgorithm,
    /// Digest for chunk hashes and Merkle nodes (default: blake3)
    pub hash: HashAlgorithm,
    /// Store a chunk uncompressed if the codec fails (default: false, failure is fatal)
    pub store_raw_on_compression_failure: bool,
    /// Compression codec and level (default: gzip level 6)
    pub compression: CompressionAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Orphaned chunks younger than this are never swept (default: 7 days)
    pub orphan_retention_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Key prefix for chunk blobs (default: "sessions")
    pub blob_prefix: String,
    /// Where sealed chunk bytes live (default: in-process memory)
    pub backend: BlobBackend,
}

/// Blob backend selection, tagged by `kind`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlobBackend {
    #[default]
    Memory,
    Fs {
        root: PathBuf,
    },
    S3(S3Settings),
}

/// S3-compatible endpoint. Credentials are read from the named environment
/// variables when the store is opened, never from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Reject plaintext `http://` endpoints instead of warning
    pub enforce_tls: bool,
    pub access_key_env: String,
    pub secret_key_env: String,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "us-east-1".into(),
            bucket: String::new(),
            enforce_tls: false,
            access_key_env: "AWS_ACCESS_KEY_ID".into(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".into(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            aead: AeadAlgorithm::default(),
            hash: HashAlgorithm::default(),
            store_raw_on_compression_failure: false,
            compression: CompressionAlgorithm::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            orphan_retention_secs: 7 * 24 * 3600,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_prefix: "sessions".into(),
            backend: BlobBackend::default(),
        }
    }
}

impl RetentionConfig {
    pub fn orphan_retention(&self) -> Duration {
        Duration::from_secs(self.orphan_retention_secs)
    }
}

impl SealConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(s: &str) -> SealResult<Self> {
        let config: SealConfig =
            toml::from_str(s).map_err(|e| SealError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> SealResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(SealConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| SealError::Config(format!("reading config {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Reject values the pipeline cannot honor.
    pub fn validate(&self) -> SealResult<()> {
        if self.chunking.max_chunk_size == 0 {
            return Err(SealError::Config(
                "chunking.max_chunk_size must be greater than zero".into(),
            ));
        }

        match self.transform.compression {
            CompressionAlgorithm::Gzip { level } if level > 9 => {
                return Err(SealError::Config(format!(
                    "gzip level {level} out of range (0..=9)"
                )));
            }
            CompressionAlgorithm::Zstd { level } if !(1..=22).contains(&level) => {
                return Err(SealError::Config(format!(
                    "zstd level {level} out of range (1..=22)"
                )));
            }
            _ => {}
        }

        if self.storage.blob_prefix.trim_matches('/').is_empty() {
            return Err(SealError::Config("storage.blob_prefix must not be empty".into()));
        }

        self.storage.backend.validate()
    }
}

impl BlobBackend {
    fn validate(&self) -> SealResult<()> {
        match self {
            BlobBackend::Memory => Ok(()),
            BlobBackend::Fs { root } if root.as_os_str().is_empty() => Err(SealError::Config(
                "storage.backend.root must not be empty".into(),
            )),
            BlobBackend::Fs { .. } => Ok(()),
            BlobBackend::S3(s3) => {
                if s3.endpoint.is_empty() || s3.bucket.is_empty() {
                    return Err(SealError::Config(
                        "storage.backend endpoint and bucket are required for s3".into(),
                    ));
                }
                if s3.enforce_tls && s3.endpoint.starts_with("http://") {
                    return Err(SealError::Config(format!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                        s3.endpoint
                    )));
                }
                Ok(())
            }
        }
    }
}
