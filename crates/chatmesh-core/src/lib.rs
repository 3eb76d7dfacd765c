//! # chatmesh core
//!
//! Pure primitives for the chatmesh replication network: identifiers, the
//! peer model, replicated chat entities and the Merkle trees built over them.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`PeerId`] / [`EntityId`] - Opaque 128-bit identifiers
//! - [`Peer`] - A known node with address and liveness state
//! - [`Entity`] - Sum type over every replicated record
//! - [`MerkleEntity`] - Id + deterministic content hash + conflict timestamp
//! - [`MerkleTree`] - Per-kind hash tree used to detect divergence
//!
//! ## Canonicalization
//!
//! Content hashes are computed over deterministic CBOR. See [`canonical`].

pub mod canonical;
pub mod entity;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod peer;
pub mod types;

pub use canonical::CanonicalFields;
pub use entity::{
    Channel, ChannelInvitation, ChannelMembership, Entity, EntityKind, File, InvitationStatus,
    MerkleEntity, Message, MessageKind, User,
};
pub use error::CoreError;
pub use hash::Blake3Hash;
pub use merkle::{EntityDigest, MerkleTree};
pub use peer::{Peer, PeerAddress, PeerState};
pub use types::{now_millis, EntityId, PeerId};
