//! Canonical CBOR encoding of entity contents.
//!
//! Content hashes must agree across replicas, so every entity is lowered to
//! a CBOR map with small integer keys and encoded deterministically:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are i64 milliseconds)

use ciborium::value::Value;

use crate::entity::{
    Channel, ChannelInvitation, ChannelMembership, EntityKind, File, InvitationStatus, Message,
    MessageKind, User,
};
use crate::hash::Blake3Hash;
use crate::types::EntityId;

const CONTENT_DOMAIN: &[u8] = b"chatmesh-entity-v1:";

/// Lowering of a record into its canonical CBOR value.
pub trait CanonicalFields {
    fn canonical_fields(&self) -> Value;
}

/// Hash of a record's canonical encoding, scoped by its kind.
pub fn content_hash(kind: EntityKind, fields: &Value) -> Blake3Hash {
    let mut buf = vec![kind.tag()];
    encode_value_to(&mut buf, fields);
    Blake3Hash::hash_with_domain(CONTENT_DOMAIN, &buf)
}

/// Encode a CBOR value to canonical bytes.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

fn map(entries: Vec<(u64, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Integer(k.into()), v))
            .collect(),
    )
}

fn id(id: &EntityId) -> Value {
    Value::Bytes(id.0.to_vec())
}

fn opt_id(v: &Option<EntityId>) -> Value {
    v.as_ref().map(id).unwrap_or(Value::Null)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn int(n: i64) -> Value {
    Value::Integer(n.into())
}

impl CanonicalFields for User {
    fn canonical_fields(&self) -> Value {
        map(vec![
            (0, id(&self.id)),
            (1, text(&self.username)),
            (2, text(&self.email)),
            (3, self.photo_id.as_deref().map(text).unwrap_or(Value::Null)),
            (4, text(&self.password_hash)),
            (5, text(&self.status)),
            (6, int(self.created_at)),
        ])
    }
}

impl CanonicalFields for Channel {
    fn canonical_fields(&self) -> Value {
        map(vec![
            (0, id(&self.id)),
            (1, text(&self.name)),
            (2, Value::Bool(self.private)),
            (3, id(&self.owner_id)),
            (4, int(self.created_at)),
        ])
    }
}

impl CanonicalFields for ChannelMembership {
    fn canonical_fields(&self) -> Value {
        map(vec![
            (0, id(&self.id)),
            (1, id(&self.channel_id)),
            (2, id(&self.user_id)),
        ])
    }
}

impl CanonicalFields for ChannelInvitation {
    fn canonical_fields(&self) -> Value {
        let status = match self.status {
            InvitationStatus::Pending => 0,
            InvitationStatus::Accepted => 1,
            InvitationStatus::Rejected => 2,
        };
        map(vec![
            (0, id(&self.id)),
            (1, id(&self.channel_id)),
            (2, id(&self.inviter_id)),
            (3, id(&self.invitee_id)),
            (4, int(status)),
            (5, int(self.created_at)),
        ])
    }
}

impl CanonicalFields for Message {
    fn canonical_fields(&self) -> Value {
        let kind = match self.kind {
            MessageKind::Text => 0,
            MessageKind::Audio => 1,
            MessageKind::File => 2,
        };
        map(vec![
            (0, id(&self.id)),
            (1, id(&self.sender_id)),
            (2, opt_id(&self.channel_id)),
            (3, opt_id(&self.recipient_id)),
            (4, int(kind)),
            (5, text(&self.content)),
            (6, int(self.sent_at)),
        ])
    }
}

impl CanonicalFields for File {
    fn canonical_fields(&self) -> Value {
        map(vec![
            (0, id(&self.id)),
            (1, text(&self.name)),
            (2, text(&self.mime_type)),
            (3, Value::Integer(self.size.into())),
            (4, Value::Bytes(self.payload_hash.0.to_vec())),
            (5, int(self.uploaded_at)),
        ])
    }
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        // Floats and tags are never produced by the lowerings above.
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a map with keys sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_integers_single_byte() {
        assert_eq!(canonical_bytes(&int(0)), vec![0x00]);
        assert_eq!(canonical_bytes(&int(23)), vec![0x17]);
        assert_eq!(canonical_bytes(&int(24)), vec![0x18, 24]);
        assert_eq!(canonical_bytes(&int(-1)), vec![0x20]);
    }

    #[test]
    fn test_map_keys_sorted_regardless_of_insertion() {
        let a = map(vec![(2, int(1)), (0, int(2)), (1, int(3))]);
        let b = map(vec![(0, int(2)), (1, int(3)), (2, int(1))]);
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
        assert_eq!(canonical_bytes(&b), vec![0xa3, 0x00, 0x02, 0x01, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_kind_scopes_hash() {
        let fields = map(vec![(0, int(1))]);
        assert_ne!(
            content_hash(EntityKind::User, &fields),
            content_hash(EntityKind::Channel, &fields)
        );
    }

    #[test]
    fn test_optional_fields_encode_as_null() {
        assert_eq!(canonical_bytes(&opt_id(&None)), vec![0xf6]);
    }
}
