//! Error types for the sync engine.

use thiserror::Error;

use chatmesh_core::{Blake3Hash, EntityId, EntityKind};

/// Errors that can abort a sync phase.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] chatmesh_store::StoreError),

    #[error("network error: {0}")]
    Net(#[from] chatmesh_net::NetError),

    /// A peer answered with data that does not fit the request.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("expected a {expected} entity, got {got}")]
    KindMismatch { expected: EntityKind, got: EntityKind },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    /// Received file bytes do not hash to the recorded payload hash.
    #[error("payload of file {file_id} hashes to {actual}, expected {expected}")]
    IntegrityMismatch {
        file_id: EntityId,
        expected: Blake3Hash,
        actual: Blake3Hash,
    },

    /// Every online peer failed during one pass.
    #[error("no peer could be reconciled: {0}")]
    AllPeersFailed(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
