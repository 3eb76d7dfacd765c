//! Storage traits consumed by the replication core.
//!
//! The sync engine never touches a database directly. It reads and writes
//! replicated entities through [`EntityStore`], file bytes through
//! [`FileStore`], and the peer registry may persist through [`PeerStore`].

use async_trait::async_trait;
use bytes::Bytes;
use chatmesh_core::{Entity, EntityId, EntityKind, Peer};

use crate::error::Result;

/// Persistence of replicated entities.
///
/// # Design Notes
///
/// - **Deterministic listing**: `list_all_for_sync` returns a kind's full
///   collection ordered by creation time then id, so two replicas with the
///   same contents build the same Merkle tree.
/// - **Idempotent saves**: saving a record identical to the stored one
///   returns `false` and changes nothing.
#[async_trait]
pub trait EntityStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Every entity of `kind`, ordered by (timestamp, id).
    async fn list_all_for_sync(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Look up one entity.
    async fn find_by_id(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or overwrite an entity.
    ///
    /// Returns `true` when the stored content changed.
    async fn save(&self, entity: &Entity) -> Result<bool>;

    /// Remove an entity. Returns `true` if it existed.
    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool>;
}

/// Storage of binary file payloads referenced by [`chatmesh_core::File`].
#[async_trait]
pub trait FileStore: Send + Sync {
    /// The payload bytes, or `None` if not held locally.
    async fn fetch_payload(&self, file_id: &EntityId) -> Result<Option<Bytes>>;

    /// Store a payload. Returns `true` if it was newly written.
    async fn store_payload(&self, file_id: &EntityId, payload: Bytes) -> Result<bool>;

    async fn has_payload(&self, file_id: &EntityId) -> Result<bool> {
        Ok(self.fetch_payload(file_id).await?.is_some())
    }
}

/// Durable peer records, so a restarted node remembers its network.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn load_peers(&self) -> Result<Vec<Peer>>;

    async fn upsert_peer(&self, peer: &Peer) -> Result<()>;
}

/// Convenience operations available on every [`EntityStore`].
#[async_trait]
pub trait EntityStoreExt: EntityStore {
    /// Save every entity, returning how many changed the store.
    async fn save_all(&self, entities: &[Entity]) -> Result<usize> {
        let mut changed = 0;
        for entity in entities {
            if self.save(entity).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Number of stored entities of `kind`.
    async fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self.list_all_for_sync(kind).await?.len())
    }
}

impl<S: EntityStore + ?Sized> EntityStoreExt for S {}
