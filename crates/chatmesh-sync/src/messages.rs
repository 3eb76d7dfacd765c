//! Reply payloads of the sync actions.
//!
//! Requests reuse the typed [`chatmesh_net::PeerRequest`] variants; this
//! module defines what comes back in `Response::data`.
//!
//! ```text
//! sync-check-all                   → RootHashes   {hashes: {kind: root}}
//! sync-get-ids {type}              → IdListReply  {type, entries: [{id, hash}]}
//! sync-get-entity {type, id}       → EntityReply  {type, entity}
//! sync-compare-entity {type, id}   → EntityReply  {type, entity}
//! sync-fetch-file {fileId}         → FileReply    {fileId, content (base64)}
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use chatmesh_core::{Blake3Hash, Entity, EntityDigest, EntityId, EntityKind};

use crate::error::{Result, SyncError};

/// Root hash per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootHashes {
    pub hashes: BTreeMap<EntityKind, Blake3Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdListReply {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub entries: Vec<EntityDigest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReply {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub entity: Entity,
}

impl EntityReply {
    /// Unwrap the entity, checking it is of the kind that was asked for.
    pub fn into_entity(self, expected: EntityKind) -> Result<Entity> {
        use chatmesh_core::MerkleEntity;

        let got = self.entity.kind();
        if self.kind != expected || got != expected {
            return Err(SyncError::KindMismatch { expected, got });
        }
        Ok(self.entity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReply {
    pub file_id: EntityId,
    /// Base64 (standard alphabet, padded) payload bytes.
    pub content: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl FileReply {
    pub fn new(file_id: EntityId, payload: &[u8], correlation_id: Option<String>) -> Self {
        Self {
            file_id,
            content: STANDARD.encode(payload),
            correlation_id,
        }
    }

    pub fn payload(&self) -> Result<Bytes> {
        STANDARD
            .decode(&self.content)
            .map(Bytes::from)
            .map_err(|e| SyncError::InvalidPayload(format!("file {} content: {e}", self.file_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmesh_core::ChannelMembership;
    use serde_json::json;

    #[test]
    fn test_root_hashes_keyed_by_wire_name() {
        let mut hashes = BTreeMap::new();
        hashes.insert(EntityKind::Message, Blake3Hash::ZERO);
        let value = serde_json::to_value(RootHashes { hashes }).unwrap();
        assert_eq!(value, json!({"hashes": {"message": Blake3Hash::ZERO.to_hex()}}));
    }

    #[test]
    fn test_file_reply_base64() {
        let reply = FileReply::new(EntityId::from_bytes([1; 16]), b"hello", None);
        assert_eq!(reply.content, "aGVsbG8=");
        assert_eq!(reply.payload().unwrap(), Bytes::from_static(b"hello"));

        let bad = FileReply {
            content: "***".into(),
            ..reply
        };
        assert!(matches!(bad.payload(), Err(SyncError::InvalidPayload(_))));
    }

    #[test]
    fn test_entity_reply_kind_checked() {
        let entity = Entity::Membership(ChannelMembership {
            id: EntityId::from_bytes([1; 16]),
            channel_id: EntityId::from_bytes([2; 16]),
            user_id: EntityId::from_bytes([3; 16]),
        });
        let reply = EntityReply {
            kind: EntityKind::Membership,
            entity,
        };
        assert!(reply.clone().into_entity(EntityKind::Membership).is_ok());
        assert!(matches!(
            reply.into_entity(EntityKind::User),
            Err(SyncError::KindMismatch { .. })
        ));
    }
}
