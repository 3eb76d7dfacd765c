//! Replicated entities.
//!
//! Every record that takes part in synchronization implements
//! [`MerkleEntity`]: it has a stable id, a deterministic content hash, and
//! (for most kinds) a timestamp used to settle conflicting versions.
//!
//! Kinds are synchronized in [`EntityKind::SYNC_ORDER`], parents before the
//! children that reference them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::canonical::{self, CanonicalFields};
use crate::error::CoreError;
use crate::hash::Blake3Hash;
use crate::types::EntityId;

/// The replicated collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Channel,
    Membership,
    Invitation,
    Message,
    File,
}

impl EntityKind {
    /// Fixed order in which kinds are compared and reconciled.
    pub const SYNC_ORDER: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Channel,
        EntityKind::Membership,
        EntityKind::Invitation,
        EntityKind::Message,
        EntityKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Channel => "channel",
            EntityKind::Membership => "membership",
            EntityKind::Invitation => "invitation",
            EntityKind::Message => "message",
            EntityKind::File => "file",
        }
    }

    /// Small integer tag used in canonical encodings.
    pub fn tag(&self) -> u8 {
        match self {
            EntityKind::User => 1,
            EntityKind::Channel => 2,
            EntityKind::Membership => 3,
            EntityKind::Invitation => 4,
            EntityKind::Message => 5,
            EntityKind::File => 6,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::SYNC_ORDER
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

/// Capability shared by every replicated record.
pub trait MerkleEntity: CanonicalFields {
    fn id(&self) -> EntityId;

    fn kind(&self) -> EntityKind;

    /// Creation or send time used for conflict resolution.
    ///
    /// `None` means the kind carries no reliable timestamp.
    fn timestamp(&self) -> Option<i64>;

    /// Deterministic hash over every field of the record.
    fn content_hash(&self) -> Blake3Hash {
        canonical::content_hash(self.kind(), &self.canonical_fields())
    }

    /// Ordering key for Merkle leaves: creation time, then id.
    fn sort_key(&self) -> (i64, EntityId) {
        (self.timestamp().unwrap_or(i64::MIN), self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: EntityId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub photo_id: Option<String>,
    pub password_hash: String,
    pub status: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: EntityId,
    pub name: String,
    pub private: bool,
    pub owner_id: EntityId,
    pub created_at: i64,
}

/// Link between a user and a channel. Carries no timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMembership {
    pub id: EntityId,
    pub channel_id: EntityId,
    pub user_id: EntityId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInvitation {
    pub id: EntityId,
    pub channel_id: EntityId,
    pub inviter_id: EntityId,
    pub invitee_id: EntityId,
    pub status: InvitationStatus,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Audio,
    File,
}

/// A chat message, addressed to a channel or directly to a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: EntityId,
    pub sender_id: EntityId,
    #[serde(default)]
    pub channel_id: Option<EntityId>,
    #[serde(default)]
    pub recipient_id: Option<EntityId>,
    pub kind: MessageKind,
    pub content: String,
    pub sent_at: i64,
}

/// Metadata of an uploaded file. The bytes live in a file store and are
/// identified by `payload_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: EntityId,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub payload_hash: Blake3Hash,
    pub uploaded_at: i64,
}

impl MerkleEntity for User {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::User
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.created_at)
    }
}

impl MerkleEntity for Channel {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::Channel
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.created_at)
    }
}

impl MerkleEntity for ChannelMembership {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::Membership
    }
    fn timestamp(&self) -> Option<i64> {
        None
    }
}

impl MerkleEntity for ChannelInvitation {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::Invitation
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.created_at)
    }
}

impl MerkleEntity for Message {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::Message
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.sent_at)
    }
}

impl MerkleEntity for File {
    fn id(&self) -> EntityId {
        self.id
    }
    fn kind(&self) -> EntityKind {
        EntityKind::File
    }
    fn timestamp(&self) -> Option<i64> {
        Some(self.uploaded_at)
    }
}

/// Any replicated record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "lowercase")]
pub enum Entity {
    User(User),
    Channel(Channel),
    Membership(ChannelMembership),
    Invitation(ChannelInvitation),
    Message(Message),
    File(File),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Entity::User($inner) => $body,
            Entity::Channel($inner) => $body,
            Entity::Membership($inner) => $body,
            Entity::Invitation($inner) => $body,
            Entity::Message($inner) => $body,
            Entity::File($inner) => $body,
        }
    };
}

impl CanonicalFields for Entity {
    fn canonical_fields(&self) -> ciborium::value::Value {
        delegate!(self, e => e.canonical_fields())
    }
}

impl MerkleEntity for Entity {
    fn id(&self) -> EntityId {
        delegate!(self, e => e.id())
    }
    fn kind(&self) -> EntityKind {
        delegate!(self, e => e.kind())
    }
    fn timestamp(&self) -> Option<i64> {
        delegate!(self, e => e.timestamp())
    }
}

impl Entity {
    pub fn as_file(&self) -> Option<&File> {
        match self {
            Entity::File(f) => Some(f),
            _ => None,
        }
    }
}

impl From<User> for Entity {
    fn from(e: User) -> Self {
        Entity::User(e)
    }
}

impl From<Channel> for Entity {
    fn from(e: Channel) -> Self {
        Entity::Channel(e)
    }
}

impl From<ChannelMembership> for Entity {
    fn from(e: ChannelMembership) -> Self {
        Entity::Membership(e)
    }
}

impl From<ChannelInvitation> for Entity {
    fn from(e: ChannelInvitation) -> Self {
        Entity::Invitation(e)
    }
}

impl From<Message> for Entity {
    fn from(e: Message) -> Self {
        Entity::Message(e)
    }
}

impl From<File> for Entity {
    fn from(e: File) -> Self {
        Entity::File(e)
    }
}
