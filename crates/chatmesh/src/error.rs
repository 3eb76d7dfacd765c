//! Error types for the node.

use chatmesh_core::CoreError;
use chatmesh_net::NetError;
use chatmesh_store::StoreError;
use chatmesh_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while starting or driving a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Transport or protocol error.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
