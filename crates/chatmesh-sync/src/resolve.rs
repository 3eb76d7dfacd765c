//! Conflict resolution between two versions of one entity.
//!
//! Earliest timestamp wins; equal timestamps fall to the lower content
//! hash. Both rules are symmetric, so any two replicas pick the same
//! winner whichever side runs the comparison.
//!
//! Kinds without a timestamp (memberships) have no such rule. For them the
//! remote version is accepted as-is. That fallback is asymmetric, so it is
//! spelled out here as [`Resolution::AcceptRemote`] via
//! [`Rule::RemoteFallback`] rather than left implicit.

use chatmesh_core::MerkleEntity;

/// Which rule decided a conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    Identical,
    EarlierTimestamp,
    LowerHash,
    RemoteFallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Both versions hash the same.
    Identical,
    KeepLocal(Rule),
    AcceptRemote(Rule),
}

impl Resolution {
    pub fn accepts_remote(&self) -> bool {
        matches!(self, Resolution::AcceptRemote(_))
    }
}

/// Decide between the local and remote version of the same entity.
pub fn resolve<E: MerkleEntity>(local: &E, remote: &E) -> Resolution {
    let local_hash = local.content_hash();
    let remote_hash = remote.content_hash();
    if local_hash == remote_hash {
        return Resolution::Identical;
    }

    match (local.timestamp(), remote.timestamp()) {
        (Some(l), Some(r)) if l < r => Resolution::KeepLocal(Rule::EarlierTimestamp),
        (Some(l), Some(r)) if r < l => Resolution::AcceptRemote(Rule::EarlierTimestamp),
        (Some(_), Some(_)) => {
            if remote_hash < local_hash {
                Resolution::AcceptRemote(Rule::LowerHash)
            } else {
                Resolution::KeepLocal(Rule::LowerHash)
            }
        }
        _ => Resolution::AcceptRemote(Rule::RemoteFallback),
    }
}
