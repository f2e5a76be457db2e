//! chunkseal-crypto: per-session key material and the chunk transform pipeline
//!
//! Pipeline per chunk:
//! ```text
//! raw ──hash──▶ hash_original
//!  │
//!  └─compress─▶ payload ──hash──▶ hash_compressed
//!                 │
//!                 └─seal([codec tag] || payload, AAD = session_id)─▶ [nonce][ciphertext][tag] ──hash──▶ hash_encrypted
//! ```
//!
//! `hash_encrypted` is the Merkle leaf. Keys live only inside a
//! `TransformPipeline` and are overwritten when the session is cleaned up.

pub mod keys;
pub mod pipeline;
pub mod seal;

pub use keys::{generate_session_key, SessionKey};
pub use pipeline::{ChunkMetadata, OpenedChunk, SessionKeyInfo, SessionStats, TransformPipeline};
pub use seal::{open, seal};

/// Size of a session key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;
