//! Root and id-level comparison against a peer.
//!
//! Pure functions over a local [`Forest`] and a peer's replies; nothing here
//! touches the network or the store.

use std::collections::HashSet;

use chatmesh_core::{EntityDigest, EntityId, EntityKind, MerkleTree};

use crate::forest::Forest;
use crate::messages::RootHashes;

/// Outcome of comparing root hashes with one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootComparison {
    /// Kinds whose roots match, in sync order.
    pub synchronized: Vec<EntityKind>,
    /// Kinds whose roots differ, in sync order.
    pub mismatched: Vec<EntityKind>,
}

impl RootComparison {
    pub fn is_converged(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Compare every kind present on both sides. Kinds the peer did not report
/// are ignored.
pub fn compare_roots(local: &Forest, remote: &RootHashes) -> RootComparison {
    let mut outcome = RootComparison::default();
    for kind in EntityKind::SYNC_ORDER {
        let (Some(tree), Some(theirs)) = (local.tree(kind), remote.hashes.get(&kind)) else {
            continue;
        };
        if tree.root() == *theirs {
            outcome.synchronized.push(kind);
        } else {
            outcome.mismatched.push(kind);
        }
    }
    outcome
}

/// Id-level difference for one kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdDiff {
    /// Held remotely, absent locally. In the peer's order.
    pub missing: Vec<EntityId>,
    /// Held on both sides with different content. In the peer's order.
    pub differing: Vec<EntityId>,
    /// Held locally only.
    pub local_only: usize,
}

impl IdDiff {
    /// Nothing to pull: the peer only lacks what we hold.
    pub fn is_local_ahead(&self) -> bool {
        self.missing.is_empty() && self.differing.is_empty() && self.local_only > 0
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.differing.is_empty() && self.local_only == 0
    }
}

pub fn diff_ids(local: &MerkleTree, remote: &[EntityDigest]) -> IdDiff {
    let mut diff = IdDiff::default();
    let mut seen: HashSet<EntityId> = HashSet::with_capacity(remote.len());

    for entry in remote {
        if !seen.insert(entry.id) {
            continue;
        }
        match local.leaf_hash(&entry.id) {
            None => diff.missing.push(entry.id),
            Some(hash) if hash != entry.hash => diff.differing.push(entry.id),
            Some(_) => {}
        }
    }
    diff.local_only = local.ids().filter(|id| !seen.contains(id)).count();
    diff
}
