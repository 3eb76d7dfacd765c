//! # chatmesh store
//!
//! Persistence collaborators for a chatmesh node.
//!
//! ## Overview
//!
//! The replication core is storage-agnostic: it reads and writes through the
//! [`EntityStore`], [`FileStore`] and [`PeerStore`] traits. [`SqliteStore`]
//! is the persistent implementation, [`MemoryStore`] serves tests and
//! ephemeral nodes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatmesh_core::EntityKind;
//! use chatmesh_store::{EntityStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("node.db").unwrap();
//!     let users = store.list_all_for_sync(EntityKind::User).await.unwrap();
//!     println!("{} users", users.len());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{EntityStore, EntityStoreExt, FileStore, PeerStore};
