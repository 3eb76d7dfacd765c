//! Error types for the networking layer.

use thiserror::Error;

use chatmesh_core::{CoreError, PeerAddress};

use crate::discovery::JoinError;
use crate::pool::PoolKind;

/// Errors that can occur while moving messages between peers.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// No session became available before the checkout deadline.
    #[error("no session available in {pool} pool{}", target_suffix(.address))]
    NoSession {
        pool: PoolKind,
        address: Option<PeerAddress>,
    },

    #[error("could not connect to {address} after {attempts} attempts: {reason}")]
    ConnectFailed {
        address: PeerAddress,
        attempts: u32,
        reason: String,
    },

    /// Well-formed JSON that is not a valid message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("{action} call timed out")]
    Timeout { action: String },

    /// The remote answered with an error status.
    #[error("remote error for {action}: {message}")]
    Remote { action: String, message: String },

    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelation(String),

    #[error("session closed")]
    Closed,

    #[error("join failed: {0}")]
    Join(#[from] JoinError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

fn target_suffix(address: &Option<PeerAddress>) -> String {
    address
        .as_ref()
        .map(|a| format!(" for {a}"))
        .unwrap_or_default()
}

/// Result type for networking operations.
pub type Result<T> = std::result::Result<T, NetError>;
