//! # chatmesh testkit
//!
//! Testing utilities for chatmesh.
//!
//! ## Overview
//!
//! - **Fixtures**: deterministic entity builders and a sample chat dataset
//! - **Generators**: proptest strategies for ids, entities and addresses
//! - **Network**: real nodes on loopback TCP, started in-process
//!
//! ## Test Network
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use chatmesh_testkit::{sample_dataset, wait_until, TestNetwork};
//! use chatmesh_core::EntityKind;
//!
//! # async fn example() -> chatmesh::Result<()> {
//! let net = TestNetwork::start(vec![sample_dataset(1, 10), Vec::new()]).await?;
//! net.join_all().await?;
//! net.node(1).node.sync().force().await?;
//!
//! let converged = wait_until(Duration::from_secs(5), || async {
//!     net.node(1).entities(EntityKind::Message).await.len() == 10
//! })
//! .await;
//! assert!(converged);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod network;

pub use fixtures::{sample_dataset, EntityFactory, EPOCH_MS};
pub use network::{fast_config, wait_until, TestNetwork, TestNode};
