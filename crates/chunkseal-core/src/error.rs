use thiserror::Error;

use crate::types::IntegrityStage;

pub type SealResult<T> = Result<T, SealError>;

/// How a caller should react to a `SealError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Blob/metadata I/O; the caller may retry a bounded number of times
    Transient,
    /// Tamper or corruption evidence; never retried
    Integrity,
    /// Ordering or state bug; fatal for the current session
    Sequencing,
    /// Resource or primitive failure; abort the session
    Fatal,
    /// The addressed session, tree, or leaf does not exist
    NotFound,
    /// Operation stopped at a chunk boundary on request
    Cancelled,
    /// Invalid configuration
    Config,
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed for session {session_id}: {reason}")]
    Encryption { session_id: String, reason: String },

    #[error("authentication failed for session {session_id}: ciphertext or tag was altered")]
    Authentication { session_id: String },

    #[error("decryption failed for session {session_id}: {reason}")]
    Decryption { session_id: String, reason: String },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("session {0} has no key material (not initialized or already cleaned up)")]
    UnknownSession(String),

    #[error("session {0} is already initialized")]
    SessionExists(String),

    #[error("no chunks found for session {0}")]
    SessionNotFound(String),

    #[error("session {0} is archived; restore it before writing")]
    SessionArchived(String),

    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("storage delete failed: {0}")]
    StorageDelete(String),

    #[error("duplicate chunk: {0}")]
    DuplicateChunk(String),

    #[error("integrity failure in chunk {chunk_id} at stage {stage}: {detail}")]
    Integrity {
        chunk_id: String,
        stage: IntegrityStage,
        detail: String,
    },

    #[error("session {session_id}: missing chunk sequence {expected} (next stored sequence: {found:?})")]
    MissingSequence {
        session_id: String,
        expected: u64,
        found: Option<u64>,
    },

    #[error("session {session_id}: out-of-order chunk write, expected sequence {expected}, got {got}")]
    OutOfOrder {
        session_id: String,
        expected: u64,
        got: u64,
    },

    #[error("no Merkle tree for session {0}")]
    TreeNotFound(String),

    #[error("Merkle tree for session {0} already exists")]
    TreeExists(String),

    #[error("Merkle tree for session {0} is finalized; no further leaves may be appended")]
    TreeFinalized(String),

    #[error("chunk {chunk_id} is not a leaf of the tree for session {session_id}")]
    LeafNotFound { session_id: String, chunk_id: String },

    #[error("chunk {chunk_id} is already a leaf of the tree for session {session_id}")]
    DuplicateLeaf { session_id: String, chunk_id: String },

    #[error("operation cancelled for session {0}")]
    Cancelled(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SealError {
    /// Classify this error for retry and abort decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            SealError::StorageWrite(_)
            | SealError::StorageRead(_)
            | SealError::StorageDelete(_)
            | SealError::Io(_) => ErrorClass::Transient,

            SealError::Authentication { .. }
            | SealError::Decryption { .. }
            | SealError::Decompression(_)
            | SealError::Integrity { .. } => ErrorClass::Integrity,

            SealError::MissingSequence { .. }
            | SealError::OutOfOrder { .. }
            | SealError::DuplicateChunk(_)
            | SealError::DuplicateLeaf { .. }
            | SealError::SessionExists(_)
            | SealError::SessionArchived(_)
            | SealError::TreeExists(_)
            | SealError::TreeFinalized(_) => ErrorClass::Sequencing,

            SealError::UnknownSession(_)
            | SealError::SessionNotFound(_)
            | SealError::TreeNotFound(_)
            | SealError::LeafNotFound { .. } => ErrorClass::NotFound,

            SealError::Cancelled(_) => ErrorClass::Cancelled,
            SealError::Config(_) => ErrorClass::Config,

            SealError::KeyGeneration(_)
            | SealError::Encryption { .. }
            | SealError::Compression(_)
            | SealError::Other(_) => ErrorClass::Fatal,
        }
    }

    /// Only transient storage failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// True for tamper/corruption evidence.
    pub fn is_integrity_failure(&self) -> bool {
        self.class() == ErrorClass::Integrity
    }
}
