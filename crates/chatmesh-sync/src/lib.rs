//! # chatmesh sync
//!
//! Merkle reconciliation between chatmesh replicas.
//!
//! ## Overview
//!
//! Each replica keeps one Merkle tree per entity kind. A cycle compares
//! root hashes with every online peer, narrows mismatches down to id lists,
//! pulls what is missing, settles conflicting versions and finally fetches
//! file payloads. Replicas converge when every kind's root agrees.
//!
//! ## Key Properties
//!
//! - **Single-flight**: one cycle at a time per node, guarded by a
//!   generation-tagged flag
//! - **Idempotent**: applying the same remote entity twice changes nothing
//! - **Deterministic conflicts**: earlier timestamp wins, then lower content
//!   hash, so both sides of a conflict pick the same version
//! - **Bounded**: restarts are capped; a suspended engine waits for
//!   [`SyncEngine::force`]
//!
//! ## Message Flow
//!
//! ```text
//! Node A (initiator)                       Node B (responder)
//!   |-- sync-check-all ---------------------->|
//!   |<------------------ {hashes} ------------|
//!   |-- sync-get-ids {type} ----------------->|   per mismatched kind
//!   |<------------------ {entries} -----------|
//!   |-- sync-get-entity {type, id} ---------->|   per missing id
//!   |<------------------ {entity} ------------|
//!   |-- sync-compare-entity {type, id} ------>|   per differing id
//!   |<------------------ {entity} ------------|
//!   |-- sync-fetch-file {fileId} ------------>|   per absent payload
//!   |<------------------ {content} -----------|
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatmesh_core::{PeerAddress, PeerId};
//! use chatmesh_net::{Messenger, MessengerConfig, PeerRegistry, Pools, Router};
//! use chatmesh_store::MemoryStore;
//! use chatmesh_sync::{SyncConfig, SyncEngine};
//!
//! # async fn example() -> chatmesh_sync::Result<()> {
//! let registry = Arc::new(PeerRegistry::new(PeerId::random(), PeerAddress::new("127.0.0.1", 9000)));
//! let router = Arc::new(Router::new());
//! let messenger = Arc::new(Messenger::new(Arc::new(Pools::new()), router.clone(), MessengerConfig::default()));
//!
//! let engine = Arc::new(SyncEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     registry.clone(),
//!     messenger,
//!     SyncConfig::default(),
//! ));
//! engine.register_handlers(&router);
//! registry.add_observer(engine.peer_trigger());
//! engine.spawn_scheduler();
//!
//! let outcome = engine.force().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod convergence;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod forest;
pub mod handler;
pub mod messages;
pub mod resolve;
pub mod state;

pub use convergence::{compare_roots, diff_ids, IdDiff, RootComparison};
pub use engine::{CycleOutcome, SkipReason, SyncConfig, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{ChannelObserver, SyncEvent, SyncObserver};
pub use files::{verify_payload, FileReport};
pub use forest::Forest;
pub use handler::SyncHandler;
pub use messages::{EntityReply, FileReply, IdListReply, RootHashes};
pub use resolve::{resolve, Resolution, Rule};
pub use state::CycleState;
