//! Proptest generators for property-based testing.

use proptest::prelude::*;

use chatmesh_core::{
    Blake3Hash, Channel, ChannelMembership, Entity, EntityId, Message, MessageKind, PeerAddress,
    PeerId, User,
};

/// Generate a random EntityId.
pub fn entity_id() -> impl Strategy<Value = EntityId> {
    any::<[u8; 16]>().prop_map(EntityId::from_bytes)
}

/// Generate a random PeerId.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 16]>().prop_map(PeerId::from_bytes)
}

/// Generate a random Blake3Hash.
pub fn blake3_hash() -> impl Strategy<Value = Blake3Hash> {
    any::<[u8; 32]>().prop_map(Blake3Hash::from)
}

/// Generate a loopback-style peer address.
pub fn peer_address() -> impl Strategy<Value = PeerAddress> {
    (1u8..=254, 1024u16..=65535).prop_map(|(host, port)| PeerAddress::new(format!("10.0.0.{host}"), port))
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=4_102_444_800_000
}

pub fn message_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Text),
        Just(MessageKind::Audio),
        Just(MessageKind::File),
    ]
}

pub fn user() -> impl Strategy<Value = User> {
    (entity_id(), "[a-z]{3,12}", timestamp()).prop_map(|(id, name, created_at)| User {
        id,
        email: format!("{name}@example.org"),
        username: name,
        photo_id: None,
        password_hash: String::new(),
        status: "offline".to_string(),
        created_at,
    })
}

pub fn channel() -> impl Strategy<Value = Channel> {
    (entity_id(), "[a-z-]{1,20}", any::<bool>(), entity_id(), timestamp()).prop_map(
        |(id, name, private, owner_id, created_at)| Channel {
            id,
            name,
            private,
            owner_id,
            created_at,
        },
    )
}

pub fn membership() -> impl Strategy<Value = ChannelMembership> {
    (entity_id(), entity_id(), entity_id()).prop_map(|(id, channel_id, user_id)| ChannelMembership {
        id,
        channel_id,
        user_id,
    })
}

pub fn message() -> impl Strategy<Value = Message> {
    (
        entity_id(),
        entity_id(),
        entity_id(),
        message_kind(),
        ".{0,64}",
        timestamp(),
    )
        .prop_map(|(id, sender_id, channel_id, kind, content, sent_at)| Message {
            id,
            sender_id,
            channel_id: Some(channel_id),
            recipient_id: None,
            kind,
            content,
            sent_at,
        })
}

/// Any entity of a kind with a generator here.
pub fn entity() -> impl Strategy<Value = Entity> {
    prop_oneof![
        user().prop_map(Entity::User),
        channel().prop_map(Entity::Channel),
        membership().prop_map(Entity::Membership),
        message().prop_map(Entity::Message),
    ]
}

/// Up to `max` messages.
pub fn messages(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message(), 0..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmesh_core::{EntityKind, MerkleEntity, MerkleTree};

    proptest! {
        #[test]
        fn test_tree_contains_every_message(messages in messages(20)) {
            let tree = MerkleTree::build(EntityKind::Message, &messages);
            for m in &messages {
                prop_assert_eq!(tree.leaf_hash(&m.id()), Some(m.content_hash()));
            }
        }

        #[test]
        fn test_entity_kind_matches_variant(entity in entity()) {
            let expected = match &entity {
                Entity::User(_) => EntityKind::User,
                Entity::Channel(_) => EntityKind::Channel,
                Entity::Membership(_) => EntityKind::Membership,
                Entity::Message(_) => EntityKind::Message,
                _ => unreachable!(),
            };
            prop_assert_eq!(entity.kind(), expected);
        }
    }
}
