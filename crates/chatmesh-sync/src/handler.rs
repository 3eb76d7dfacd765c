//! Responder side of the sync actions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chatmesh_net::action::{EntityQuery, FileQuery, KindQuery};
use chatmesh_net::{actions, ActionHandler, PeerRequest, RequestContext, Response, Router};
use chatmesh_store::{EntityStore, FileStore};

use crate::error::{Result, SyncError};
use crate::forest::Forest;
use crate::messages::{EntityReply, FileReply, IdListReply};

/// Answers the five sync actions from the local stores.
pub struct SyncHandler {
    entities: Arc<dyn EntityStore>,
    files: Arc<dyn FileStore>,
}

impl SyncHandler {
    pub fn new(entities: Arc<dyn EntityStore>, files: Arc<dyn FileStore>) -> Self {
        Self { entities, files }
    }

    pub fn register(self, router: &Router) {
        let handler: Arc<dyn ActionHandler> = Arc::new(self);
        for action in [
            actions::SYNC_CHECK_ALL,
            actions::SYNC_GET_IDS,
            actions::SYNC_GET_ENTITY,
            actions::SYNC_COMPARE_ENTITY,
            actions::SYNC_FETCH_FILE,
        ] {
            router.register_action_handler(action, handler.clone());
        }
    }

    async fn check_all(&self) -> Result<Response> {
        let forest = Forest::build(self.entities.as_ref()).await?;
        Ok(Response::with_data(actions::SYNC_CHECK_ALL, &forest.root_hashes())?)
    }

    async fn ids(&self, query: KindQuery) -> Result<Response> {
        let tree = Forest::build_kind(self.entities.as_ref(), query.kind).await?;
        let reply = IdListReply {
            kind: query.kind,
            entries: tree.digests().to_vec(),
        };
        Ok(Response::with_data(actions::SYNC_GET_IDS, &reply)?)
    }

    async fn entity(&self, action: &str, query: EntityQuery) -> Result<Response> {
        let entity = self
            .entities
            .find_by_id(query.kind, &query.id)
            .await?
            .ok_or(SyncError::NotFound {
                kind: query.kind,
                id: query.id,
            })?;
        let reply = EntityReply {
            kind: query.kind,
            entity,
        };
        Ok(Response::with_data(action, &reply)?)
    }

    async fn file(&self, query: FileQuery) -> Result<Response> {
        let Some(payload) = self.files.fetch_payload(&query.file_id).await? else {
            return Ok(Response::error(actions::SYNC_FETCH_FILE, "file not found"));
        };
        let reply = FileReply::new(query.file_id, &payload, Some(query.correlation_id));
        Ok(Response::with_data(actions::SYNC_FETCH_FILE, &reply)?)
    }
}

#[async_trait]
impl ActionHandler for SyncHandler {
    async fn handle(&self, request: PeerRequest, ctx: &RequestContext) -> chatmesh_net::Result<Response> {
        let action = request.action();
        debug!(action, peer = %ctx.sender(), "sync request");

        let outcome = match request {
            PeerRequest::SyncCheckAll => self.check_all().await,
            PeerRequest::SyncGetIds(query) => self.ids(query).await,
            PeerRequest::SyncGetEntity(query) | PeerRequest::SyncCompareEntity(query) => {
                self.entity(action, query).await
            }
            PeerRequest::SyncFetchFile(query) => self.file(query).await,
            _ => return Ok(Response::error(action, "not a sync action")),
        };

        Ok(outcome.unwrap_or_else(|e| {
            if !matches!(e, SyncError::NotFound { .. }) {
                warn!(action, error = %e, "sync request failed");
            }
            Response::error(action, e.to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RootHashes;
    use bytes::Bytes;
    use chatmesh_core::{Blake3Hash, Entity, EntityId, EntityKind, File, PeerAddress};
    use chatmesh_net::{PoolKind, Session};
    use chatmesh_store::MemoryStore;

    fn file_entity() -> Entity {
        Entity::File(File {
            id: EntityId::from_bytes([7; 16]),
            name: "a.png".into(),
            mime_type: "image/png".into(),
            size: 3,
            payload_hash: Blake3Hash::hash(b"png"),
            uploaded_at: 5,
        })
    }

    fn setup() -> (Arc<MemoryStore>, SyncHandler, RequestContext) {
        let store = Arc::new(MemoryStore::with_entities([file_entity()]));
        let handler = SyncHandler::new(store.clone(), store.clone());
        let (session, _far) = Session::pair(PeerAddress::new("127.0.0.1", 1), PeerAddress::new("127.0.0.1", 2));
        (store, handler, RequestContext::new(Arc::new(session), PoolKind::Peers))
    }

    #[tokio::test]
    async fn test_check_all_lists_every_kind() {
        let (_store, handler, ctx) = setup();
        let response = handler.handle(PeerRequest::SyncCheckAll, &ctx).await.unwrap();
        let roots: RootHashes = response.decode_data().unwrap();
        assert_eq!(roots.hashes.len(), EntityKind::SYNC_ORDER.len());
        assert_ne!(roots.hashes[&EntityKind::File], roots.hashes[&EntityKind::Message]);
    }

    #[tokio::test]
    async fn test_get_ids_and_entity() {
        let (_store, handler, ctx) = setup();
        let ids: IdListReply = handler
            .handle(PeerRequest::SyncGetIds(KindQuery { kind: EntityKind::File }), &ctx)
            .await
            .unwrap()
            .decode_data()
            .unwrap();
        assert_eq!(ids.entries.len(), 1);

        let query = EntityQuery {
            kind: EntityKind::File,
            id: ids.entries[0].id,
            compare_content: true,
        };
        let reply: EntityReply = handler
            .handle(PeerRequest::SyncCompareEntity(query), &ctx)
            .await
            .unwrap()
            .decode_data()
            .unwrap();
        assert_eq!(reply.entity, file_entity());
    }

    #[tokio::test]
    async fn test_unknown_entity_is_error_response() {
        let (_store, handler, ctx) = setup();
        let query = EntityQuery {
            kind: EntityKind::User,
            id: EntityId::from_bytes([1; 16]),
            compare_content: false,
        };
        let response = handler.handle(PeerRequest::SyncGetEntity(query), &ctx).await.unwrap();
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let (store, handler, ctx) = setup();
        let query = FileQuery {
            file_id: EntityId::from_bytes([7; 16]),
            correlation_id: "f1".into(),
        };

        let missing = handler.handle(PeerRequest::SyncFetchFile(query.clone()), &ctx).await.unwrap();
        assert!(!missing.is_success());
        assert_eq!(missing.message, "file not found");

        store.store_payload(&query.file_id, Bytes::from_static(b"png")).await.unwrap();
        let reply: FileReply = handler
            .handle(PeerRequest::SyncFetchFile(query), &ctx)
            .await
            .unwrap()
            .decode_data()
            .unwrap();
        assert_eq!(reply.payload().unwrap(), Bytes::from_static(b"png"));
        assert_eq!(reply.correlation_id.as_deref(), Some("f1"));
    }
}
