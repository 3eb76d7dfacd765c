//! In-memory implementation of the store traits.
//!
//! Primarily for tests and ephemeral nodes. Same semantics as SQLite, no
//! persistence.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use chatmesh_core::{Entity, EntityId, EntityKind, MerkleEntity, Peer, PeerId};

use crate::error::Result;
use crate::traits::{EntityStore, FileStore, PeerStore};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    entities: HashMap<EntityKind, HashMap<EntityId, Entity>>,
    payloads: HashMap<EntityId, Bytes>,
    peers: HashMap<PeerId, Peer>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    /// Create a store pre-populated with `entities`.
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap_or_else(PoisonError::into_inner);
            for entity in entities {
                inner
                    .entities
                    .entry(entity.kind())
                    .or_default()
                    .insert(entity.id(), entity);
            }
        }
        store
    }

    /// Total number of stored entities across all kinds.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entities.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn list_all_for_sync(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<Entity> = inner
            .entities
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        items.sort_by_key(|e| e.sort_key());
        Ok(items)
    }

    async fn find_by_id(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.entities.get(&kind).and_then(|m| m.get(id)).cloned())
    }

    async fn save(&self, entity: &Entity) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = inner.entities.entry(entity.kind()).or_default();
        match slot.get(&entity.id()) {
            Some(existing) if existing == entity => Ok(false),
            _ => {
                slot.insert(entity.id(), entity.clone());
                Ok(true)
            }
        }
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .entities
            .get_mut(&kind)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn fetch_payload(&self, file_id: &EntityId) -> Result<Option<Bytes>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.payloads.get(file_id).cloned())
    }

    async fn store_payload(&self, file_id: &EntityId, payload: Bytes) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.payloads.insert(*file_id, payload).is_none())
    }

    async fn has_payload(&self, file_id: &EntityId) -> Result<bool> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.payloads.contains_key(file_id))
    }
}

#[async_trait]
impl PeerStore for MemoryStore {
    async fn load_peers(&self) -> Result<Vec<Peer>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<Peer> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(peers)
    }

    async fn upsert_peer(&self, peer: &Peer) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // One record per address.
        inner
            .peers
            .retain(|id, p| *id == peer.id || p.address != peer.address);
        inner.peers.insert(peer.id, peer.clone());
        Ok(())
    }
}
