//! Level-addressed Merkle construction, proofs, and verification
//!
//! Everything here is a pure function of the ordered leaf list, so an
//! external verifier holding only the leaves (or one leaf and its proof) can
//! reproduce the root.

use serde::{Deserialize, Serialize};

use chunkseal_chunks::hash_pair;
use chunkseal_core::{Digest, HashAlgorithm};

/// Position of a node: `level` 0 is the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub level: usize,
    pub index: usize,
}

impl NodeId {
    pub fn leaf(index: usize) -> Self {
        Self { level: 0, index }
    }

    pub fn parent(self) -> Self {
        Self {
            level: self.level + 1,
            index: self.index / 2,
        }
    }

    /// Sibling slot; may be past the end of an odd level, in which case the
    /// node is paired with itself.
    pub fn sibling(self) -> Self {
        Self {
            level: self.level,
            index: self.index ^ 1,
        }
    }

    pub fn is_left(self) -> bool {
        self.index % 2 == 0
    }
}

/// Which side the sibling sits on when re-hashing toward the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

fn next_level(level: &[Digest], algorithm: HashAlgorithm) -> Vec<Digest> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(algorithm, left, right),
            // Odd node: hash with itself
            [only] => hash_pair(algorithm, only, only),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Build every level from the leaves up. `levels[0]` is the leaves and the
/// last level holds the root alone. No leaves means no levels.
pub fn build_levels(leaves: &[Digest], algorithm: HashAlgorithm) -> Vec<Vec<Digest>> {
    if leaves.is_empty() {
        return Vec::new();
    }

    let mut levels = vec![leaves.to_vec()];
    while let Some(top) = levels.last().filter(|l| l.len() > 1) {
        let parent = next_level(top, algorithm);
        levels.push(parent);
    }
    levels
}

/// Root of the tree over `leaves`: all-zero for no leaves, the leaf itself
/// for one.
pub fn compute_root(leaves: &[Digest], algorithm: HashAlgorithm) -> Digest {
    match leaves.len() {
        0 => Digest::ZERO,
        1 => leaves[0],
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                level = next_level(&level, algorithm);
            }
            level[0]
        }
    }
}

/// Height (levels above the leaves) of a tree with `levels`.
pub fn height_of(levels: &[Vec<Digest>]) -> u32 {
    levels.len().saturating_sub(1) as u32
}

/// Collect sibling hashes from leaf `index` up to (excluding) the root.
///
/// Returns `None` if `index` is not a leaf of `levels`.
pub fn proof_for(levels: &[Vec<Digest>], index: usize) -> Option<Vec<ProofStep>> {
    let leaves = levels.first()?;
    if index >= leaves.len() {
        return None;
    }

    let mut proof = Vec::with_capacity(levels.len().saturating_sub(1));
    let mut node = NodeId::leaf(index);
    for level in &levels[..levels.len() - 1] {
        let sibling_id = node.sibling();
        let sibling = level
            .get(sibling_id.index)
            .copied()
            .unwrap_or(level[node.index]);
        let side = if node.is_left() { Side::Right } else { Side::Left };
        proof.push(ProofStep { sibling, side });
        node = node.parent();
    }
    Some(proof)
}

/// Recompute a root from one leaf and its proof path.
pub fn fold_proof(leaf: &Digest, proof: &[ProofStep], algorithm: HashAlgorithm) -> Digest {
    proof.iter().fold(*leaf, |acc, step| match step.side {
        Side::Left => hash_pair(algorithm, &step.sibling, &acc),
        Side::Right => hash_pair(algorithm, &acc, &step.sibling),
    })
}

/// True if `leaf` with `proof` hashes up to `root`.
pub fn verify_proof(
    leaf: &Digest,
    proof: &[ProofStep],
    root: &Digest,
    algorithm: HashAlgorithm,
) -> bool {
    fold_proof(leaf, proof, algorithm) == *root
}
