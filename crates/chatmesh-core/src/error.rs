//! Error types for chatmesh core primitives.

use thiserror::Error;

/// Errors raised while parsing or validating core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("encoding error: {0}")]
    EncodingError(String),
}

impl From<hex::FromHexError> for CoreError {
    fn from(e: hex::FromHexError) -> Self {
        CoreError::InvalidId(e.to_string())
    }
}
