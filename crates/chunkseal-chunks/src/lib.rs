//! chunkseal-chunks: content hashing, compression codecs, and segmentation
//!
//! # Overview
//! - `hash`: BLAKE3 / SHA-256 digests for chunk stages and Merkle nodes
//! - `compress`: closed set of codecs (gzip, zstd, none) behind a one-byte tag
//! - `segment`: fixed upper-bound chunk boundaries for in-memory buffers

pub mod compress;
pub mod hash;
pub mod segment;

// Convenience re-exports for the most common operations
pub use compress::{compress, decompress, Codec, Compressed};
pub use hash::{hash_bytes, hash_pair, StreamHasher};
pub use segment::{segment_slice, Segment};
