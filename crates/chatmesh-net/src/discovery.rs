//! Peer discovery: join, peer-list exchange and peer-push.
//!
//! ## Join
//!
//! ```text
//!   joiner                                   responder
//!     │ peer-join {address, correlationId}      │
//!     │────────────────────────────────────────►│ register sender ONLINE
//!     │                                         │ (reuse id for a known address)
//!     │ {assignedId, correlationId, responderId}│
//!     │◄────────────────────────────────────────│
//!     │ validate, register responder ONLINE     │
//! ```
//!
//! A push (`peer-push`) carries no authority: the recipient answers it by
//! fetching the sender's peer list itself.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use chatmesh_core::{Peer, PeerAddress, PeerId, PeerState};

use crate::action::{
    actions, new_correlation_id, JoinAccepted, JoinRequest, PeerListReply, PeerListRequest,
    PeerPush, PeerRequest,
};
use crate::error::{NetError, Result};
use crate::messenger::Messenger;
use crate::pool::PoolKind;
use crate::registry::{PeerObserver, PeerRegistry};
use crate::router::{ActionHandler, RequestContext, Router};
use crate::wire::{Response, CORRELATION_KEY};

/// Why a join attempt failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("no response")]
    NoResponse,

    #[error("rejected by responder: {0}")]
    Rejected(String),

    #[error("correlation id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: String, got: String },

    #[error("response carries no usable assigned id")]
    MissingId,

    #[error("timed out waiting for response")]
    TimedOut,

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Initiated,
    Sent,
    Succeeded,
    Failed,
    TimedOut,
}

impl JoinState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JoinState::Succeeded | JoinState::Failed | JoinState::TimedOut)
    }
}

/// Trace of one join attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinAttempt {
    pub target: PeerAddress,
    pub correlation_id: String,
    history: Vec<JoinState>,
}

impl JoinAttempt {
    pub fn new(target: PeerAddress, correlation_id: String) -> Self {
        Self {
            target,
            correlation_id,
            history: vec![JoinState::Initiated],
        }
    }

    pub fn state(&self) -> JoinState {
        self.history.last().copied().unwrap_or(JoinState::Initiated)
    }

    pub fn history(&self) -> &[JoinState] {
        &self.history
    }

    fn advance(&mut self, next: JoinState) {
        if !self.state().is_terminal() {
            self.history.push(next);
        }
    }

    fn finish(&mut self, result: &std::result::Result<PeerId, JoinError>) {
        self.advance(match result {
            Ok(_) => JoinState::Succeeded,
            Err(JoinError::TimedOut) => JoinState::TimedOut,
            Err(_) => JoinState::Failed,
        });
    }
}

/// Check a join response against the correlation id that was sent.
pub fn validate_join_response(
    response: Option<&Response>,
    correlation_id: &str,
) -> std::result::Result<JoinAccepted, JoinError> {
    let response = response.ok_or(JoinError::NoResponse)?;
    if !response.is_success() {
        return Err(JoinError::Rejected(response.message.clone()));
    }
    let data = response.data.as_ref().ok_or(JoinError::NoResponse)?;

    let got = data
        .get(CORRELATION_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default();
    if got != correlation_id {
        return Err(JoinError::CorrelationMismatch {
            expected: correlation_id.to_string(),
            got: got.to_string(),
        });
    }

    let assigned_id = data
        .get("assignedId")
        .and_then(Value::as_str)
        .and_then(|s| PeerId::from_hex(s).ok())
        .ok_or(JoinError::MissingId)?;
    let responder_id = data
        .get("responderId")
        .and_then(Value::as_str)
        .and_then(|s| PeerId::from_hex(s).ok());

    Ok(JoinAccepted {
        assigned_id,
        correlation_id: got.to_string(),
        responder_id,
    })
}

pub struct Discovery {
    registry: Arc<PeerRegistry>,
    messenger: Arc<Messenger>,
    name: Option<String>,
    last_join: Mutex<Option<JoinAttempt>>,
}

impl Discovery {
    pub fn new(registry: Arc<PeerRegistry>, messenger: Arc<Messenger>) -> Self {
        Self {
            registry,
            messenger,
            name: None,
            last_join: Mutex::new(None),
        }
    }

    /// Name announced to peers on join.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn last_join(&self) -> Option<JoinAttempt> {
        self.last_join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_join_state(&self) -> Option<JoinState> {
        self.last_join().map(|a| a.state())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Join the network through `target`. Resolves with the id `target`
    /// assigned to this node.
    pub async fn join(&self, target: &PeerAddress) -> std::result::Result<PeerId, JoinError> {
        let correlation_id = new_correlation_id();
        let mut attempt = JoinAttempt::new(target.clone(), correlation_id.clone());

        let result = self.run_join(target, &correlation_id, &mut attempt).await;
        attempt.finish(&result);
        match &result {
            Ok(id) => info!(peer = %target, assigned = ?id, "joined"),
            Err(e) => warn!(peer = %target, error = %e, "join failed"),
        }
        *self.last_join.lock().unwrap_or_else(PoisonError::into_inner) = Some(attempt);
        result
    }

    async fn run_join(
        &self,
        target: &PeerAddress,
        correlation_id: &str,
        attempt: &mut JoinAttempt,
    ) -> std::result::Result<PeerId, JoinError> {
        let request = PeerRequest::Join(JoinRequest {
            address: self.registry.local_address().clone(),
            correlation_id: correlation_id.to_string(),
            name: self.name.clone(),
        })
        .to_request()
        .map_err(|e| JoinError::Transport(e.to_string()))?;

        attempt.advance(JoinState::Sent);
        let response = match self.messenger.call(target, request, correlation_id).await {
            Ok(response) => response,
            Err(NetError::Timeout { .. }) => return Err(JoinError::TimedOut),
            Err(e) => return Err(JoinError::Transport(e.to_string())),
        };

        let accepted = validate_join_response(Some(&response), correlation_id)?;
        self.registry
            .register_or_update(target, accepted.responder_id, None);
        Ok(accepted.assigned_id)
    }

    /// Fetch `target`'s peer list and merge it. Returns the merged records.
    pub async fn fetch_peer_list(&self, target: &PeerAddress) -> Result<Vec<Peer>> {
        let correlation_id = new_correlation_id();
        let request = PeerRequest::PeerList(PeerListRequest {
            address: self.registry.local_address().clone(),
            correlation_id: correlation_id.clone(),
        })
        .to_request()?;

        let response = self.messenger.call(target, request, &correlation_id).await?;
        let reply: PeerListReply = response.decode_data()?;
        if let Some(got) = &reply.correlation_id {
            if *got != correlation_id {
                return Err(NetError::Protocol(format!(
                    "peer-list correlation mismatch: expected {correlation_id}, got {got}"
                )));
            }
        }

        let merged = self.merge(reply.peers);
        debug!(peer = %target, merged = merged.len(), "peer list merged");
        Ok(merged)
    }

    fn merge(&self, peers: Vec<Peer>) -> Vec<Peer> {
        let mut merged = Vec::new();
        for peer in peers {
            let Some(registration) = self.registry.learn(&peer) else {
                continue;
            };
            if registration.inserted && registration.peer.state == PeerState::Online {
                self.connect_in_background(registration.peer.address.clone());
            }
            merged.push(registration.peer);
        }
        merged
    }

    fn connect_in_background(&self, address: PeerAddress) {
        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger.ensure_session(&address, PoolKind::Peers).await {
                debug!(peer = %address, error = %e, "background connect failed");
            }
        });
    }

    /// Join `seed`, then pull its peer list.
    pub async fn bootstrap(&self, seed: &PeerAddress) -> Result<Vec<Peer>> {
        self.join(seed).await?;
        self.fetch_peer_list(seed).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    fn accept_join(&self, request: JoinRequest) -> Result<Response> {
        let Some(registration) =
            self.registry
                .register_or_update(&request.address, None, request.name)
        else {
            return Ok(Response::error(actions::PEER_JOIN, "cannot join a node to itself"));
        };
        let accepted = JoinAccepted {
            assigned_id: registration.peer.id,
            correlation_id: request.correlation_id,
            responder_id: Some(self.registry.local_id()),
        };
        Response::with_data(actions::PEER_JOIN, &accepted)
    }

    fn list_peers(&self, request: PeerListRequest) -> Result<Response> {
        let mut peers = self.registry.list_all();
        peers.push(self.registry.self_record());
        let reply = PeerListReply {
            peers,
            correlation_id: Some(request.correlation_id),
        };
        Response::with_data(actions::PEER_LIST, &reply)
    }

    /// Install the join, peer-list and peer-push handlers.
    pub fn register_handlers(self: &Arc<Self>, router: &Router) {
        let handler: Arc<dyn ActionHandler> = Arc::new(DiscoveryHandler {
            discovery: self.clone(),
        });
        router.register_action_handler(actions::PEER_JOIN, handler.clone());
        router.register_action_handler(actions::PEER_LIST, handler.clone());
        router.register_action_handler(actions::PEER_PUSH, handler);
    }
}

struct DiscoveryHandler {
    discovery: Arc<Discovery>,
}

#[async_trait]
impl ActionHandler for DiscoveryHandler {
    async fn handle(&self, request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
        match request {
            PeerRequest::Join(join) => self.discovery.accept_join(join),
            PeerRequest::PeerList(list) => self.discovery.list_peers(list),
            PeerRequest::PeerPush(PeerPush { address }) => {
                // Reply first; the fetch runs on its own task.
                let discovery = self.discovery.clone();
                tokio::spawn(async move {
                    if let Err(e) = discovery.fetch_peer_list(&address).await {
                        debug!(peer = %address, error = %e, "peer-list after push failed");
                    }
                });
                Ok(Response::success(actions::PEER_PUSH, "ok", None))
            }
            other => Ok(Response::error(
                other.action(),
                format!("{} is not a discovery action", other.action()),
            )),
        }
    }
}

/// Tells the rest of the network when a new peer appears.
pub struct PushPublisher {
    registry: Weak<PeerRegistry>,
    messenger: Arc<Messenger>,
}

impl PushPublisher {
    pub fn new(registry: &Arc<PeerRegistry>, messenger: Arc<Messenger>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            messenger,
        }
    }
}

impl PeerObserver for PushPublisher {
    fn on_peer_registered(&self, peer: &Peer) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = match PeerRequest::PeerPush(PeerPush {
            address: registry.local_address().clone(),
        })
        .to_request()
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "could not encode peer-push");
                return;
            }
        };

        let newcomer = peer.address.clone();
        let targets: Vec<PeerAddress> = registry
            .list_active()
            .into_iter()
            .map(|p| p.address)
            .filter(|a| *a != newcomer)
            .collect();
        if targets.is_empty() {
            return;
        }

        let messenger = self.messenger.clone();
        runtime.spawn(async move {
            for target in targets {
                if let Err(e) = messenger.send_to(&target, &request, PoolKind::Peers).await {
                    debug!(peer = %target, error = %e, "peer-push not delivered");
                }
            }
        });
    }
}
