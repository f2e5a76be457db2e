//! chunkseal-core: shared types, configuration schema, and error taxonomy
//!
//! Every other chunkseal crate depends on this one for the `Digest` type,
//! the persisted `ChunkRecord`, the closed algorithm enumerations, and
//! `SealError`.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::{BlobBackend, S3Settings, SealConfig};
pub use error::{ErrorClass, SealError, SealResult};
pub use types::{
    AeadAlgorithm, ChunkRecord, ChunkStatistics, CompressionAlgorithm, Digest, HashAlgorithm,
    IntegrityStage,
};

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
