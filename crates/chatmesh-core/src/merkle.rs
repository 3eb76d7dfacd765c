//! Merkle trees over entity collections.
//!
//! A tree is built per [`EntityKind`] from the full collection of that kind.
//! Leaves are entity content hashes ordered by [`MerkleEntity::sort_key`],
//! so the root depends only on the set of contents, never on the order the
//! store returned them in.
//!
//! ```text
//!              root
//!            /      \
//!        h(ab)      h(cd)        internal = blake3(domain || left || right)
//!        /  \        /  \
//!       a    b      c    d       leaves = content hashes
//! ```
//!
//! A trailing odd node is promoted to the next level unchanged. The empty
//! tree has root [`Blake3Hash::ZERO`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entity::{EntityKind, MerkleEntity};
use crate::hash::Blake3Hash;
use crate::types::EntityId;

const NODE_DOMAIN: &[u8] = b"chatmesh-merkle-node-v1:";

/// An entity id paired with its content hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDigest {
    pub id: EntityId,
    pub hash: Blake3Hash,
}

/// Hash tree over one entity collection.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    kind: EntityKind,
    root: Blake3Hash,
    leaves: Vec<EntityDigest>,
    index: HashMap<EntityId, usize>,
}

impl MerkleTree {
    /// Build a tree from a collection of one kind.
    pub fn build<E: MerkleEntity>(kind: EntityKind, entities: &[E]) -> Self {
        let mut keyed: Vec<((i64, EntityId), EntityDigest)> = entities
            .iter()
            .map(|e| {
                (
                    e.sort_key(),
                    EntityDigest {
                        id: e.id(),
                        hash: e.content_hash(),
                    },
                )
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let leaves: Vec<EntityDigest> = keyed.into_iter().map(|(_, d)| d).collect();
        let index = leaves
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id, i))
            .collect();
        let root = compute_root(leaves.iter().map(|d| d.hash).collect());

        Self {
            kind,
            root,
            leaves,
            index,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn root(&self) -> Blake3Hash {
        self.root
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Content hash of the entity with the given id, if it is in the tree.
    pub fn leaf_hash(&self, id: &EntityId) -> Option<Blake3Hash> {
        self.index.get(id).map(|&i| self.leaves[i].hash)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    /// Leaves in tree order.
    pub fn digests(&self) -> &[EntityDigest] {
        &self.leaves
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.leaves.iter().map(|d| d.id)
    }
}

fn compute_root(mut level: Vec<Blake3Hash>) -> Blake3Hash {
    if level.is_empty() {
        return Blake3Hash::ZERO;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_node(left, right),
                [single] => *single,
                _ => Blake3Hash::ZERO,
            })
            .collect();
    }
    level[0]
}

fn hash_node(left: &Blake3Hash, right: &Blake3Hash) -> Blake3Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_DOMAIN);
    hasher.update(&left.0);
    hasher.update(&right.0);
    Blake3Hash(*hasher.finalize().as_bytes())
}
