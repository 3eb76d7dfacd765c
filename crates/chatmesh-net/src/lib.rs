//! # chatmesh net
//!
//! Peer-to-peer plumbing for chatmesh nodes: pooled sessions, the
//! newline-delimited JSON wire format, request/response routing with
//! correlated calls, the peer registry, heartbeats and discovery.
//!
//! ## Overview
//!
//! ```text
//!  ┌──────────────┐   ┌───────────┐   ┌───────────┐
//!  │ HeartbeatMon │   │ Discovery │   │ (sync)    │
//!  └──────┬───────┘   └─────┬─────┘   └─────┬─────┘
//!         └────────┬────────┴───────────────┘
//!                  ▼
//!            ┌───────────┐  dispatch  ┌────────┐
//!            │ Messenger │◄──────────►│ Router │
//!            └─────┬─────┘            └────────┘
//!                  ▼
//!            ┌───────────┐
//!            │   Pools   │  Peers | Clients
//!            └─────┬─────┘
//!                  ▼
//!              Session (one reader, serialized writes)
//! ```
//!
//! Nothing here is global: every component is constructed explicitly and
//! shared as an `Arc`.
//!
//! ## Key Types
//!
//! - [`Session`] - One live connection with a single-reader claim
//! - [`ConnectionPool`] - Blocking checkout/checkin multiset of sessions
//! - [`PeerRequest`] - Typed request decoded at the boundary
//! - [`Router`] - Action and response handler tables
//! - [`Messenger`] - Sends, broadcasts and correlated calls
//! - [`PeerRegistry`] - Known peers, liveness, observers
//! - [`HeartbeatMonitor`] - Periodic heartbeat send and timeout sweep
//! - [`Discovery`] - Join, peer-list exchange, peer-push
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatmesh_core::{PeerAddress, PeerId};
//! use chatmesh_net::{Discovery, Messenger, MessengerConfig, PeerRegistry, Pools, Router};
//!
//! # async fn example() -> chatmesh_net::Result<()> {
//! let local = PeerAddress::new("127.0.0.1", 9000);
//! let registry = Arc::new(PeerRegistry::new(PeerId::random(), local));
//! let router = Arc::new(Router::new());
//! let messenger = Arc::new(Messenger::new(Arc::new(Pools::new()), router.clone(), MessengerConfig::default()));
//!
//! let discovery = Arc::new(Discovery::new(registry, messenger));
//! discovery.register_handlers(&router);
//! discovery.bootstrap(&"10.0.0.5:9001".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod connector;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod messenger;
pub mod pool;
pub mod registry;
pub mod router;
pub mod session;
pub mod wire;

pub use action::{actions, new_correlation_id, PeerRequest};
pub use connector::{ConnectConfig, Connector};
pub use discovery::{Discovery, JoinAttempt, JoinError, JoinState, PushPublisher};
pub use error::{NetError, Result};
pub use heartbeat::{HeartbeatConfig, HeartbeatHandler, HeartbeatMonitor};
pub use messenger::{ActivitySink, Messenger, MessengerConfig, PendingCall};
pub use pool::{ConnectionPool, PoolKind, Pools};
pub use registry::{PeerObserver, PeerRegistry, Registration, StateCounts};
pub use router::{ActionHandler, RequestContext, ResponseHandler, Router};
pub use session::{Session, SessionId, MAX_LINE_BYTES};
pub use wire::{Request, Response, Status, WireMessage};
