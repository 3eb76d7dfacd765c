//! Tree construction: one Merkle tree per kind.

use std::collections::BTreeMap;

use chatmesh_core::{Blake3Hash, EntityKind, MerkleTree};
use chatmesh_store::EntityStore;

use crate::error::Result;
use crate::messages::RootHashes;

/// The local replica's trees, one per kind.
#[derive(Clone, Debug)]
pub struct Forest {
    trees: BTreeMap<EntityKind, MerkleTree>,
}

impl Forest {
    /// Build every tree from the store, in sync order.
    pub async fn build(store: &dyn EntityStore) -> Result<Self> {
        let mut trees = BTreeMap::new();
        for kind in EntityKind::SYNC_ORDER {
            trees.insert(kind, Self::build_kind(store, kind).await?);
        }
        Ok(Self { trees })
    }

    /// Build a single kind's tree.
    pub async fn build_kind(store: &dyn EntityStore, kind: EntityKind) -> Result<MerkleTree> {
        let entities = store.list_all_for_sync(kind).await?;
        Ok(MerkleTree::build(kind, &entities))
    }

    pub fn tree(&self, kind: EntityKind) -> Option<&MerkleTree> {
        self.trees.get(&kind)
    }

    pub fn root(&self, kind: EntityKind) -> Blake3Hash {
        self.trees
            .get(&kind)
            .map(MerkleTree::root)
            .unwrap_or(Blake3Hash::ZERO)
    }

    pub fn root_hashes(&self) -> RootHashes {
        RootHashes {
            hashes: self.trees.iter().map(|(k, t)| (*k, t.root())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmesh_core::{Entity, EntityId, Message, MessageKind};
    use chatmesh_store::MemoryStore;

    fn message(n: u8, sent_at: i64) -> Entity {
        Entity::Message(Message {
            id: EntityId::from_bytes([n; 16]),
            sender_id: EntityId::from_bytes([0xee; 16]),
            channel_id: None,
            recipient_id: Some(EntityId::from_bytes([0xdd; 16])),
            kind: MessageKind::Text,
            content: format!("hi {n}"),
            sent_at,
        })
    }

    #[tokio::test]
    async fn test_forest_has_every_kind() {
        let store = MemoryStore::with_entities([message(1, 10), message(2, 20)]);
        let forest = Forest::build(&store).await.unwrap();
        let roots = forest.root_hashes();
        assert_eq!(roots.hashes.len(), EntityKind::SYNC_ORDER.len());
        assert_eq!(roots.hashes[&EntityKind::User], Blake3Hash::ZERO);
        assert_ne!(roots.hashes[&EntityKind::Message], Blake3Hash::ZERO);
        assert_eq!(forest.tree(EntityKind::Message).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replicas_with_same_content_agree() {
        let a = MemoryStore::with_entities([message(1, 10), message(2, 20)]);
        let b = MemoryStore::with_entities([message(2, 20), message(1, 10)]);
        let fa = Forest::build(&a).await.unwrap();
        let fb = Forest::build(&b).await.unwrap();
        assert_eq!(fa.root_hashes(), fb.root_hashes());
    }
}
