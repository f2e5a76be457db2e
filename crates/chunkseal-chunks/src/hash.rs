//! Content hashing for chunk stages and Merkle nodes
//!
//! Both supported algorithms produce 32-byte digests, so every hash in the
//! system fits `chunkseal_core::Digest` regardless of configuration.

use chunkseal_core::{Digest, HashAlgorithm};
use sha2::Digest as _;

/// Hash a byte slice in memory.
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Digest {
    match algorithm {
        HashAlgorithm::Blake3 => Digest::from_bytes(*blake3::hash(data).as_bytes()),
        HashAlgorithm::Sha256 => Digest::from_bytes(sha2::Sha256::digest(data).into()),
    }
}

/// Hash the concatenation `left || right` of two digests (Merkle parent).
pub fn hash_pair(algorithm: HashAlgorithm, left: &Digest, right: &Digest) -> Digest {
    let mut hasher = StreamHasher::new(algorithm);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize()
}

/// Incremental hasher for data that arrives in pieces (e.g. a stream being
/// reassembled chunk by chunk).
pub enum StreamHasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(sha2::Sha256),
}

impl StreamHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => StreamHasher::Sha256(sha2::Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Blake3(h) => {
                h.update(data);
            }
            StreamHasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            StreamHasher::Blake3(h) => Digest::from_bytes(*h.finalize().as_bytes()),
            StreamHasher::Sha256(h) => Digest::from_bytes(h.finalize().into()),
        }
    }
}
