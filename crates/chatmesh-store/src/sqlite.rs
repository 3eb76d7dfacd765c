//! SQLite implementation of the store traits.
//!
//! The persistent backend of a chatmesh node. Uses rusqlite with bundled
//! SQLite; every operation runs on the blocking pool via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use chatmesh_core::{
    now_millis, Entity, EntityId, EntityKind, MerkleEntity, Peer, PeerAddress, PeerId, PeerState,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{EntityStore, FileStore, PeerStore};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "sqlite task did not complete");
            StoreError::TaskJoin(e.to_string())
        })?
    }
}

fn encode_entity(entity: &Entity) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(entity, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_entity(body: &[u8]) -> Result<Entity> {
    ciborium::from_reader(body).map_err(|e| {
        warn!(error = %e, len = body.len(), "stored entity does not decode");
        StoreError::Serialization(e.to_string())
    })
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn list_all_for_sync(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM entities WHERE kind = ?1 ORDER BY sort_ts ASC, entity_id ASC",
            )?;
            let bodies = stmt
                .query_map(params![kind.as_str()], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode_entity(b)).collect()
        })
        .await
    }

    async fn find_by_id(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        let id = *id;
        self.blocking(move |conn| {
            let body: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT body FROM entities WHERE kind = ?1 AND entity_id = ?2",
                    params![kind.as_str(), id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| decode_entity(&b)).transpose()
        })
        .await
    }

    async fn save(&self, entity: &Entity) -> Result<bool> {
        let entity = entity.clone();
        self.blocking(move |conn| {
            let kind = entity.kind();
            let id = entity.id();
            let hash = entity.content_hash();

            let existing: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT content_hash FROM entities WHERE kind = ?1 AND entity_id = ?2",
                    params![kind.as_str(), id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.as_deref() == Some(hash.0.as_slice()) {
                return Ok(false);
            }

            let body = encode_entity(&entity)?;
            conn.execute(
                "INSERT OR REPLACE INTO entities
                    (kind, entity_id, sort_ts, content_hash, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    kind.as_str(),
                    id.0.as_slice(),
                    entity.sort_key().0,
                    hash.0.as_slice(),
                    body,
                    now_millis(),
                ],
            )?;
            Ok(true)
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let id = *id;
        self.blocking(move |conn| {
            let n = conn.execute(
                "DELETE FROM entities WHERE kind = ?1 AND entity_id = ?2",
                params![kind.as_str(), id.0.as_slice()],
            )?;
            Ok(n > 0)
        })
        .await
    }
}

#[async_trait]
impl FileStore for SqliteStore {
    async fn fetch_payload(&self, file_id: &EntityId) -> Result<Option<Bytes>> {
        let id = *file_id;
        self.blocking(move |conn| {
            let payload: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT payload FROM file_payloads WHERE file_id = ?1",
                    params![id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(payload.map(Bytes::from))
        })
        .await
    }

    async fn store_payload(&self, file_id: &EntityId, payload: Bytes) -> Result<bool> {
        let id = *file_id;
        self.blocking(move |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO file_payloads (file_id, payload, stored_at)
                 VALUES (?1, ?2, ?3)",
                params![id.0.as_slice(), payload.as_ref(), now_millis()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn has_payload(&self, file_id: &EntityId) -> Result<bool> {
        let id = *file_id;
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM file_payloads WHERE file_id = ?1",
                    params![id.0.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[async_trait]
impl PeerStore for SqliteStore {
    async fn load_peers(&self) -> Result<Vec<Peer>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT peer_id, host, port, state, last_heartbeat, name
                 FROM peers ORDER BY host, port",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u16>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, host, port, state, last_heartbeat, name)| -> Result<Peer> {
                    Ok(Peer {
                        id: PeerId::try_from(id.as_slice())?,
                        address: PeerAddress::new(host, port),
                        state: PeerState::parse(&state).unwrap_or(PeerState::Unknown),
                        last_heartbeat,
                        name,
                    })
                })
                .collect()
        })
        .await
    }

    async fn upsert_peer(&self, peer: &Peer) -> Result<()> {
        let peer = peer.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM peers WHERE host = ?1 AND port = ?2 AND peer_id != ?3",
                params![peer.address.host, peer.address.port, peer.id.0.as_slice()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO peers (peer_id, host, port, state, last_heartbeat, name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    peer.id.0.as_slice(),
                    peer.address.host,
                    peer.address.port,
                    peer.state.as_str(),
                    peer.last_heartbeat,
                    peer.name,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmesh_core::{Blake3Hash, ChannelMembership, File, User};

    fn user(seed: u8, created_at: i64, name: &str) -> Entity {
        Entity::User(User {
            id: EntityId::from_bytes([seed; 16]),
            username: name.to_string(),
            email: format!("{name}@example.com"),
            photo_id: None,
            password_hash: "x".to_string(),
            status: "active".to_string(),
            created_at,
        })
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = SqliteStore::open_memory().unwrap();
        let u = user(1, 100, "ana");
        assert!(store.save(&u).await.unwrap());
        let found = store
            .find_by_id(EntityKind::User, &u.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, u);
        assert!(store
            .find_by_id(EntityKind::Channel, &u.id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_idempotent_save() {
        let store = SqliteStore::open_memory().unwrap();
        let u = user(1, 100, "ana");
        assert!(store.save(&u).await.unwrap());
        assert!(!store.save(&u).await.unwrap());
        assert!(store.save(&user(1, 100, "ana2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_order_matches_sort_key() {
        let store = SqliteStore::open_memory().unwrap();
        for e in [user(3, 50, "c"), user(1, 90, "a"), user(2, 50, "b")] {
            store.save(&e).await.unwrap();
        }
        let listed = store.list_all_for_sync(EntityKind::User).await.unwrap();
        let mut expected = listed.clone();
        expected.sort_by_key(|e| e.sort_key());
        assert_eq!(listed, expected);
        assert_eq!(listed[0].id(), EntityId::from_bytes([2; 16]));
    }

    #[tokio::test]
    async fn test_timestampless_kind_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let link = Entity::Membership(ChannelMembership {
            id: EntityId::from_bytes([4; 16]),
            channel_id: EntityId::from_bytes([5; 16]),
            user_id: EntityId::from_bytes([6; 16]),
        });
        store.save(&link).await.unwrap();
        let listed = store.list_all_for_sync(EntityKind::Membership).await.unwrap();
        assert_eq!(listed, vec![link.clone()]);
        assert!(store.delete(EntityKind::Membership, &link.id()).await.unwrap());
        assert!(store.list_all_for_sync(EntityKind::Membership).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_payloads() {
        let store = SqliteStore::open_memory().unwrap();
        let bytes = Bytes::from_static(b"%PDF-1.4");
        let file = File {
            id: EntityId::from_bytes([8; 16]),
            name: "doc.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: bytes.len() as u64,
            payload_hash: Blake3Hash::hash(&bytes),
            uploaded_at: 1,
        };
        assert!(!store.has_payload(&file.id).await.unwrap());
        assert!(store.store_payload(&file.id, bytes.clone()).await.unwrap());
        assert!(!store.store_payload(&file.id, bytes.clone()).await.unwrap());
        assert_eq!(store.fetch_payload(&file.id).await.unwrap(), Some(bytes));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let peer = Peer::online(PeerId::from_bytes([1; 16]), PeerAddress::new("127.0.0.1", 9000), 42);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&user(1, 1, "ana")).await.unwrap();
            store.upsert_peer(&peer).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_all_for_sync(EntityKind::User).await.unwrap().len(), 1);
        assert_eq!(store.load_peers().await.unwrap(), vec![peer]);
    }

    #[tokio::test]
    async fn test_peer_address_unique() {
        let store = SqliteStore::open_memory().unwrap();
        let addr = PeerAddress::new("10.0.0.2", 7000);
        let mut a = Peer::online(PeerId::from_bytes([1; 16]), addr.clone(), 1);
        store.upsert_peer(&a).await.unwrap();
        a.state = PeerState::Offline;
        store.upsert_peer(&a).await.unwrap();
        let b = Peer::online(PeerId::from_bytes([2; 16]), addr, 2);
        store.upsert_peer(&b).await.unwrap();
        assert_eq!(store.load_peers().await.unwrap(), vec![b]);
    }

    mod props {
        use super::*;
        use crate::memory::MemoryStore;
        use chatmesh_core::{Message, MessageKind};
        use proptest::prelude::*;

        fn message() -> impl Strategy<Value = Entity> {
            (0u8..6, 0i64..4, "[a-z ]{0,12}").prop_map(|(n, sent_at, content)| {
                Entity::Message(Message {
                    id: EntityId::from_bytes([n; 16]),
                    sender_id: EntityId::from_bytes([0xaa; 16]),
                    channel_id: Some(EntityId::from_bytes([0xcc; 16])),
                    recipient_id: None,
                    kind: MessageKind::Text,
                    content,
                    sent_at,
                })
            })
        }

        proptest! {
            #[test]
            fn test_sqlite_lists_like_memory(writes in prop::collection::vec(message(), 0..24)) {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                let (from_sqlite, from_memory) = rt.block_on(async {
                    let sqlite = SqliteStore::open_memory().unwrap();
                    let memory = MemoryStore::new();
                    for entity in &writes {
                        let a = sqlite.save(entity).await.unwrap();
                        let b = memory.save(entity).await.unwrap();
                        assert_eq!(a, b, "save outcome diverged for {}", entity.id());
                    }
                    (
                        sqlite.list_all_for_sync(EntityKind::Message).await.unwrap(),
                        memory.list_all_for_sync(EntityKind::Message).await.unwrap(),
                    )
                });
                prop_assert_eq!(from_sqlite, from_memory);
            }
        }
    }
}
