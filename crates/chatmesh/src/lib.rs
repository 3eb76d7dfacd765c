//! # chatmesh
//!
//! A peer-to-peer replication node for a distributed chat service.
//!
//! ## Overview
//!
//! Each node keeps a full replica of users, channels, memberships,
//! invitations, messages and files, and converges with the other nodes
//! without a coordinator:
//!
//! - **Registry**: known peers and their liveness, kept fresh by heartbeats
//! - **Messaging**: pooled TCP sessions carrying newline-delimited JSON,
//!   with correlated request/response calls
//! - **Discovery**: join a seed, pull its peer list, push arrivals onward
//! - **Sync**: per-kind Merkle trees, six-phase reconciliation, earliest
//!   version wins
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!   peers ──TCP──►   │ accept loop → Messenger  │ ◄── Router (actions)
//!                    └────────────┬─────────────┘
//!         ┌───────────────┬───────┴───────┬────────────────┐
//!         ▼               ▼               ▼                ▼
//!    PeerRegistry    Discovery     HeartbeatMonitor    SyncEngine
//!         │                                                │
//!         └────────────────► store (Entity/File/Peer) ◄────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatmesh::{Node, NodeConfig};
//! use chatmesh::store::SqliteStore;
//!
//! # async fn example() -> chatmesh::Result<()> {
//! let config = NodeConfig {
//!     listen: "127.0.0.1:9001".into(),
//!     seeds: vec!["127.0.0.1:9000".into()],
//!     ..NodeConfig::default()
//! };
//! let store = Arc::new(SqliteStore::open("chatmesh.db")?);
//! let node = Node::start(config, store).await?;
//!
//! println!("{} peers online", node.registry().list_active().len());
//! node.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! - `chatmesh::core` - ids, entities, Merkle trees
//! - `chatmesh::store` - storage traits, memory and SQLite stores
//! - `chatmesh::net` - sessions, routing, registry, discovery
//! - `chatmesh::sync` - the sync engine

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::Node;

pub use chatmesh_core as core;
pub use chatmesh_net as net;
pub use chatmesh_store as store;
pub use chatmesh_sync as sync;
