//! Per-session trees and their Building → Finalized lifecycle
//!
//! The registry map is only write-locked to add or remove a session. Each
//! tree sits behind its own mutex, so `add_leaf`, `finalize`, and
//! `verify_leaf` for one session are serialized (finalize is a barrier)
//! while different sessions never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chunkseal_core::{now_millis, Digest, HashAlgorithm, SealError, SealResult};

use crate::tree::{build_levels, compute_root, fold_proof, height_of, proof_for, ProofStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeState {
    Building,
    Finalized,
}

/// One leaf: a chunk's `hash_encrypted`, tagged with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub chunk_id: String,
    pub sequence: u64,
    pub hash: Digest,
}

/// Payload handed to the anchoring collaborator after finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequest {
    pub session_id: String,
    pub root_hash: Digest,
    pub leaf_count: u64,
    pub height: u32,
}

/// Export bundle of a finalized tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeProof {
    pub tree_id: String,
    pub session_id: String,
    pub hash_algorithm: HashAlgorithm,
    pub root_hash: Digest,
    pub height: u32,
    pub leaf_count: u64,
    pub created_at: u64,
    pub finalized_at: u64,
    pub leaves: Vec<LeafRecord>,
    /// `levels[0]` is the leaf hashes; the last level is the root
    pub levels: Vec<Vec<Digest>>,
}

impl TreeProof {
    pub fn anchor_request(&self) -> AnchorRequest {
        AnchorRequest {
            session_id: self.session_id.clone(),
            root_hash: self.root_hash,
            leaf_count: self.leaf_count,
            height: self.height,
        }
    }

    /// Recompute the root from the ordered leaf hashes alone.
    pub fn verify_root(&self) -> bool {
        let hashes: Vec<Digest> = self.leaves.iter().map(|l| l.hash).collect();
        compute_root(&hashes, self.hash_algorithm) == self.root_hash
    }

    /// Inclusion proof for `chunk_id`, rebuilt from the leaf list.
    pub fn prove(&self, chunk_id: &str) -> Option<Vec<ProofStep>> {
        let index = self.leaves.iter().position(|l| l.chunk_id == chunk_id)?;
        let hashes: Vec<Digest> = self.leaves.iter().map(|l| l.hash).collect();
        proof_for(&build_levels(&hashes, self.hash_algorithm), index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeStatus {
    pub tree_id: String,
    pub session_id: String,
    pub leaf_count: u64,
    pub height: u32,
    pub root_hash: Digest,
    pub finalized: bool,
}

/// Why a leaf did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The claimed hash differs from the recorded leaf
    LeafHashMismatch,
    /// The proof path does not hash up to the current root
    RootMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub chunk_id: String,
    pub leaf_index: usize,
    pub claimed_hash: Digest,
    pub recomputed_hash: Digest,
    pub root_hash: Digest,
    pub proof_path: Vec<ProofStep>,
    pub failure: Option<VerificationFailure>,
}

/// The tree of one session.
#[derive(Debug)]
pub struct SessionTree {
    tree_id: String,
    session_id: String,
    algorithm: HashAlgorithm,
    leaves: Vec<LeafRecord>,
    positions: HashMap<String, usize>,
    levels: Vec<Vec<Digest>>,
    state: TreeState,
    created_at: u64,
    finalized: Option<TreeProof>,
}

impl SessionTree {
    pub fn new(session_id: &str, algorithm: HashAlgorithm) -> Self {
        Self {
            tree_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            algorithm,
            leaves: Vec::new(),
            positions: HashMap::new(),
            levels: Vec::new(),
            state: TreeState::Building,
            created_at: now_millis(),
            finalized: None,
        }
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    pub fn root(&self) -> Digest {
        self.levels
            .last()
            .map(|top| top[0])
            .unwrap_or(Digest::ZERO)
    }

    pub fn height(&self) -> u32 {
        height_of(&self.levels)
    }

    /// Append a leaf and rebuild the levels.
    ///
    /// `sequence` must equal the current leaf count: leaf order is chunk
    /// sequence order.
    pub fn add_leaf(&mut self, chunk_id: &str, sequence: u64, hash: Digest) -> SealResult<()> {
        if self.state == TreeState::Finalized {
            warn!(
                session = %self.session_id,
                chunk = %chunk_id,
                "add_leaf rejected: tree already finalized"
            );
            return Err(SealError::TreeFinalized(self.session_id.clone()));
        }
        if self.positions.contains_key(chunk_id) {
            return Err(SealError::DuplicateLeaf {
                session_id: self.session_id.clone(),
                chunk_id: chunk_id.to_string(),
            });
        }

        let index = self.leaves.len();
        if sequence != index as u64 {
            warn!(
                session = %self.session_id,
                chunk = %chunk_id,
                expected = index,
                got = sequence,
                "add_leaf rejected: sequence does not match leaf position"
            );
            return Err(SealError::OutOfOrder {
                session_id: self.session_id.clone(),
                expected: index as u64,
                got: sequence,
            });
        }

        self.leaves.push(LeafRecord {
            chunk_id: chunk_id.to_string(),
            sequence,
            hash,
        });
        self.positions.insert(chunk_id.to_string(), index);
        self.rebuild();

        debug!(
            session = %self.session_id,
            chunk = %chunk_id,
            leaf = index,
            root = %self.root().short(),
            "leaf appended"
        );
        Ok(())
    }

    fn rebuild(&mut self) {
        let hashes: Vec<Digest> = self.leaves.iter().map(|l| l.hash).collect();
        self.levels = build_levels(&hashes, self.algorithm);
    }

    /// Freeze the tree. A second call returns the same bundle.
    pub fn finalize(&mut self) -> TreeProof {
        if let Some(proof) = &self.finalized {
            return proof.clone();
        }

        let proof = TreeProof {
            tree_id: self.tree_id.clone(),
            session_id: self.session_id.clone(),
            hash_algorithm: self.algorithm,
            root_hash: self.root(),
            height: self.height(),
            leaf_count: self.leaves.len() as u64,
            created_at: self.created_at,
            finalized_at: now_millis(),
            leaves: self.leaves.clone(),
            levels: self.levels.clone(),
        };
        self.state = TreeState::Finalized;
        self.finalized = Some(proof.clone());

        info!(
            session = %self.session_id,
            tree = %self.tree_id,
            leaves = proof.leaf_count,
            height = proof.height,
            root = %proof.root_hash,
            "merkle tree finalized"
        );
        proof
    }

    /// Check `claimed` against the recorded leaf and prove it into the
    /// current root.
    pub fn verify_leaf(&self, chunk_id: &str, claimed: Digest) -> SealResult<VerificationResult> {
        let index = *self
            .positions
            .get(chunk_id)
            .ok_or_else(|| SealError::LeafNotFound {
                session_id: self.session_id.clone(),
                chunk_id: chunk_id.to_string(),
            })?;

        let proof_path = proof_for(&self.levels, index).unwrap_or_default();
        let recomputed_hash = fold_proof(&claimed, &proof_path, self.algorithm);
        let root_hash = self.root();

        let failure = if self.leaves[index].hash != claimed {
            Some(VerificationFailure::LeafHashMismatch)
        } else if recomputed_hash != root_hash {
            Some(VerificationFailure::RootMismatch)
        } else {
            None
        };

        if let Some(f) = failure {
            warn!(
                session = %self.session_id,
                chunk = %chunk_id,
                leaf = index,
                failure = ?f,
                "leaf verification failed"
            );
        }

        Ok(VerificationResult {
            valid: failure.is_none(),
            chunk_id: chunk_id.to_string(),
            leaf_index: index,
            claimed_hash: claimed,
            recomputed_hash,
            root_hash,
            proof_path,
            failure,
        })
    }

    pub fn status(&self) -> TreeStatus {
        TreeStatus {
            tree_id: self.tree_id.clone(),
            session_id: self.session_id.clone(),
            leaf_count: self.leaves.len() as u64,
            height: self.height(),
            root_hash: self.root(),
            finalized: self.state == TreeState::Finalized,
        }
    }
}

/// All live session trees of one process.
#[derive(Debug)]
pub struct MerkleRegistry {
    algorithm: HashAlgorithm,
    trees: RwLock<HashMap<String, Arc<Mutex<SessionTree>>>>,
}

impl MerkleRegistry {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            trees: RwLock::new(HashMap::new()),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    fn tree(&self, session_id: &str) -> SealResult<Arc<Mutex<SessionTree>>> {
        self.trees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SealError::TreeNotFound(session_id.to_string()))
    }

    fn with_tree<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionTree) -> SealResult<T>,
    ) -> SealResult<T> {
        let tree = self.tree(session_id)?;
        let mut guard = tree.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Create an empty tree in Building state and return its id.
    pub fn init(&self, session_id: &str) -> SealResult<String> {
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        if trees.contains_key(session_id) {
            return Err(SealError::TreeExists(session_id.to_string()));
        }
        let tree = SessionTree::new(session_id, self.algorithm);
        let tree_id = tree.tree_id().to_string();
        trees.insert(session_id.to_string(), Arc::new(Mutex::new(tree)));

        debug!(session = %session_id, tree = %tree_id, "merkle tree initialized");
        Ok(tree_id)
    }

    pub fn add_leaf(
        &self,
        session_id: &str,
        chunk_id: &str,
        sequence: u64,
        leaf_hash: Digest,
    ) -> SealResult<bool> {
        self.with_tree(session_id, |tree| tree.add_leaf(chunk_id, sequence, leaf_hash))?;
        Ok(true)
    }

    pub fn finalize(&self, session_id: &str) -> SealResult<TreeProof> {
        self.with_tree(session_id, |tree| Ok(tree.finalize()))
    }

    pub fn verify_leaf(
        &self,
        session_id: &str,
        chunk_id: &str,
        claimed_hash: Digest,
    ) -> SealResult<VerificationResult> {
        self.with_tree(session_id, |tree| tree.verify_leaf(chunk_id, claimed_hash))
    }

    pub fn status(&self, session_id: &str) -> SealResult<TreeStatus> {
        self.with_tree(session_id, |tree| Ok(tree.status()))
    }

    /// Drop the session's tree. Returns false if there was none.
    pub fn cleanup(&self, session_id: &str) -> bool {
        let removed = self
            .trees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some();
        if removed {
            debug!(session = %session_id, "merkle tree discarded");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.trees.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
