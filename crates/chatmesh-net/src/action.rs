//! Typed requests.
//!
//! Every well-known action has a payload type. Payloads are decoded once,
//! at the substrate boundary, into a [`PeerRequest`] so handlers match on a
//! closed set of variants instead of probing untyped maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chatmesh_core::{EntityId, EntityKind, Peer, PeerAddress, PeerId};

use crate::error::{NetError, Result};
use crate::wire::Request;

/// Action names. Matching is case-insensitive; these are the canonical forms.
pub mod actions {
    pub const PEER_JOIN: &str = "peer-join";
    pub const PEER_LIST: &str = "peer-list";
    pub const PEER_PUSH: &str = "peer-push";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SYNC_CHECK_ALL: &str = "sync-check-all";
    pub const SYNC_GET_IDS: &str = "sync-get-ids";
    pub const SYNC_GET_ENTITY: &str = "sync-get-entity";
    pub const SYNC_COMPARE_ENTITY: &str = "sync-compare-entity";
    pub const SYNC_FETCH_FILE: &str = "sync-fetch-file";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Listening address of the node asking to join.
    pub address: PeerAddress,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAccepted {
    pub assigned_id: PeerId,
    pub correlation_id: String,
    /// Id of the accepting node itself.
    #[serde(default)]
    pub responder_id: Option<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListRequest {
    pub address: PeerAddress,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListReply {
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// "Something changed, come and look" signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPush {
    /// Address the recipient should fetch the peer list from.
    pub address: PeerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub peer_id: PeerId,
    pub address: PeerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindQuery {
    #[serde(rename = "type")]
    pub kind: EntityKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub id: EntityId,
    #[serde(default)]
    pub compare_content: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub file_id: EntityId,
    pub correlation_id: String,
}

/// A decoded inbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRequest {
    Join(JoinRequest),
    PeerList(PeerListRequest),
    PeerPush(PeerPush),
    Heartbeat(Heartbeat),
    SyncCheckAll,
    SyncGetIds(KindQuery),
    SyncGetEntity(EntityQuery),
    SyncCompareEntity(EntityQuery),
    SyncFetchFile(FileQuery),
}

fn payload<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T> {
    let value = request.payload.clone().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| NetError::InvalidPayload {
        action: request.action.clone(),
        reason: e.to_string(),
    })
}

impl PeerRequest {
    /// Decode a raw request. Action names match case-insensitively.
    pub fn decode(request: &Request) -> Result<Self> {
        let action = request.action.to_ascii_lowercase();
        Ok(match action.as_str() {
            actions::PEER_JOIN => PeerRequest::Join(payload(request)?),
            actions::PEER_LIST => PeerRequest::PeerList(payload(request)?),
            actions::PEER_PUSH => PeerRequest::PeerPush(payload(request)?),
            actions::HEARTBEAT => PeerRequest::Heartbeat(payload(request)?),
            actions::SYNC_CHECK_ALL => PeerRequest::SyncCheckAll,
            actions::SYNC_GET_IDS => PeerRequest::SyncGetIds(payload(request)?),
            actions::SYNC_GET_ENTITY => PeerRequest::SyncGetEntity(payload(request)?),
            actions::SYNC_COMPARE_ENTITY => PeerRequest::SyncCompareEntity(payload(request)?),
            actions::SYNC_FETCH_FILE => PeerRequest::SyncFetchFile(payload(request)?),
            _ => return Err(NetError::UnknownAction(request.action.clone())),
        })
    }

    pub fn action(&self) -> &'static str {
        match self {
            PeerRequest::Join(_) => actions::PEER_JOIN,
            PeerRequest::PeerList(_) => actions::PEER_LIST,
            PeerRequest::PeerPush(_) => actions::PEER_PUSH,
            PeerRequest::Heartbeat(_) => actions::HEARTBEAT,
            PeerRequest::SyncCheckAll => actions::SYNC_CHECK_ALL,
            PeerRequest::SyncGetIds(_) => actions::SYNC_GET_IDS,
            PeerRequest::SyncGetEntity(_) => actions::SYNC_GET_ENTITY,
            PeerRequest::SyncCompareEntity(_) => actions::SYNC_COMPARE_ENTITY,
            PeerRequest::SyncFetchFile(_) => actions::SYNC_FETCH_FILE,
        }
    }

    /// Encode into a wire request.
    pub fn to_request(&self) -> Result<Request> {
        let payload = match self {
            PeerRequest::Join(p) => Some(serde_json::to_value(p)?),
            PeerRequest::PeerList(p) => Some(serde_json::to_value(p)?),
            PeerRequest::PeerPush(p) => Some(serde_json::to_value(p)?),
            PeerRequest::Heartbeat(p) => Some(serde_json::to_value(p)?),
            PeerRequest::SyncCheckAll => None,
            PeerRequest::SyncGetIds(p) => Some(serde_json::to_value(p)?),
            PeerRequest::SyncGetEntity(p) => Some(serde_json::to_value(p)?),
            PeerRequest::SyncCompareEntity(p) => Some(serde_json::to_value(p)?),
            PeerRequest::SyncFetchFile(p) => Some(serde_json::to_value(p)?),
        };
        Ok(Request::new(self.action(), payload))
    }

    /// Listening address the sender announces about itself, if any.
    pub fn sender_address(&self) -> Option<&PeerAddress> {
        match self {
            PeerRequest::Join(p) => Some(&p.address),
            PeerRequest::PeerList(p) => Some(&p.address),
            PeerRequest::PeerPush(p) => Some(&p.address),
            PeerRequest::Heartbeat(p) => Some(&p.address),
            _ => None,
        }
    }
}

/// A fresh correlation id.
pub fn new_correlation_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}
