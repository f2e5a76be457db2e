//! chunkseal-merkle: binary hash trees over a session's ordered chunk hashes
//!
//! Leaves are the `hash_encrypted` digests of a session's chunks in sequence
//! order. Parents are `H(left || right)`; a level with an odd node count pairs
//! its last node with itself. The tree is stored level by level, so a node is
//! just `(level, index)` and its parent is `(level + 1, index / 2)`.
//!
//! [`tree`] holds the stateless algorithms a third-party verifier needs;
//! [`registry`] holds the per-session Building → Finalized state machine.

pub mod registry;
pub mod tree;

pub use registry::{
    AnchorRequest, LeafRecord, MerkleRegistry, SessionTree, TreeProof, TreeState, TreeStatus,
    VerificationFailure, VerificationResult,
};
pub use tree::{
    build_levels, compute_root, fold_proof, height_of, proof_for, verify_proof, NodeId, ProofStep,
    Side,
};
