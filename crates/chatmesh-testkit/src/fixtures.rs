//! Entity fixtures.
//!
//! Ids are derived from a per-factory seed and a counter, so two factories
//! with the same seed produce the same entities.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use chatmesh_core::{
    Blake3Hash, Channel, ChannelInvitation, ChannelMembership, Entity, EntityId, File,
    InvitationStatus, Message, MessageKind, User,
};

/// Base timestamp of generated entities (2024-01-01T00:00:00Z).
pub const EPOCH_MS: i64 = 1_704_067_200_000;

/// Builds entities with deterministic ids.
pub struct EntityFactory {
    seed: u8,
    counter: AtomicU32,
}

impl EntityFactory {
    pub fn new(seed: u8) -> Self {
        Self {
            seed,
            counter: AtomicU32::new(0),
        }
    }

    /// A fresh id: seed byte, then the counter.
    pub fn next_id(&self) -> EntityId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[0] = self.seed;
        bytes[12..].copy_from_slice(&n.to_be_bytes());
        EntityId::from_bytes(bytes)
    }

    pub fn user(&self, username: &str) -> User {
        User {
            id: self.next_id(),
            username: username.to_string(),
            email: format!("{username}@example.org"),
            photo_id: None,
            password_hash: Blake3Hash::hash(username.as_bytes()).to_hex(),
            status: "offline".to_string(),
            created_at: EPOCH_MS,
        }
    }

    pub fn channel(&self, name: &str, owner: &User) -> Channel {
        Channel {
            id: self.next_id(),
            name: name.to_string(),
            private: false,
            owner_id: owner.id,
            created_at: EPOCH_MS + 1_000,
        }
    }

    pub fn membership(&self, channel: &Channel, user: &User) -> ChannelMembership {
        ChannelMembership {
            id: self.next_id(),
            channel_id: channel.id,
            user_id: user.id,
        }
    }

    pub fn invitation(&self, channel: &Channel, inviter: &User, invitee: &User) -> ChannelInvitation {
        ChannelInvitation {
            id: self.next_id(),
            channel_id: channel.id,
            inviter_id: inviter.id,
            invitee_id: invitee.id,
            status: InvitationStatus::Pending,
            created_at: EPOCH_MS + 2_000,
        }
    }

    /// A text message to a channel, sent `offset_ms` after the epoch.
    pub fn message(&self, channel: &Channel, sender: &User, content: &str, offset_ms: i64) -> Message {
        Message {
            id: self.next_id(),
            sender_id: sender.id,
            channel_id: Some(channel.id),
            recipient_id: None,
            kind: MessageKind::Text,
            content: content.to_string(),
            sent_at: EPOCH_MS + offset_ms,
        }
    }

    /// File metadata together with its payload.
    pub fn file(&self, name: &str, payload: &[u8]) -> (File, Bytes) {
        let file = File {
            id: self.next_id(),
            name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: payload.len() as u64,
            payload_hash: Blake3Hash::hash(payload),
            uploaded_at: EPOCH_MS + 3_000,
        };
        (file, Bytes::copy_from_slice(payload))
    }
}

/// A small chat: two users, one channel, memberships, an invitation and
/// `messages` messages.
pub fn sample_dataset(seed: u8, messages: usize) -> Vec<Entity> {
    let factory = EntityFactory::new(seed);
    let alice = factory.user("alice");
    let bob = factory.user("bob");
    let general = factory.channel("general", &alice);

    let mut entities: Vec<Entity> = vec![
        factory.membership(&general, &alice).into(),
        factory.membership(&general, &bob).into(),
        factory.invitation(&general, &alice, &bob).into(),
    ];
    for i in 0..messages {
        let sender = if i % 2 == 0 { &alice } else { &bob };
        entities.push(
            factory
                .message(&general, sender, &format!("message {i}"), 10_000 + i as i64)
                .into(),
        );
    }
    entities.push(general.into());
    entities.push(alice.into());
    entities.push(bob.into());
    entities
}
