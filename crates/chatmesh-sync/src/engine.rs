//! The sync cycle coordinator.
//!
//! ## Cycle
//!
//! ```text
//!   gate ── in progress? ── too soon? ── suspended? ── no peers? ──► skip
//!     │
//!     ▼
//!   ┌─► 1. build forest ──► 2. roots vs each ONLINE peer
//!   │                              │ mismatched kinds
//!   │                              ▼
//!   │                       3. id lists
//!   │                              │
//!   │              ┌───────────────┴───────────────┐
//!   │              ▼                               ▼
//!   │     4. fetch missing              5. compare differing ids
//!   │              └───────────────┬───────────────┘
//!   │                              │ anything applied?
//!   └──────────── restart ◄── yes ─┤
//!                                  no
//!                                  ▼
//!                        6. file payloads ──► finished
//! ```
//!
//! Restarts count against `max_retries`; reaching it suspends automatic
//! cycles until [`SyncEngine::force`]. The single-flight flag is dropped
//! `lock_release_delay` after a pass starts talking to peers, so inbound
//! sync traffic is never stuck behind a long cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use chatmesh_core::{now_millis, EntityId, EntityKind, MerkleEntity, Peer, PeerAddress};
use chatmesh_net::action::{EntityQuery, KindQuery};
use chatmesh_net::{new_correlation_id, Messenger, NetError, PeerObserver, PeerRegistry, PeerRequest, Router};
use chatmesh_store::{EntityStore, FileStore};

use crate::convergence::{compare_roots, diff_ids};
use crate::error::{Result, SyncError};
use crate::events::{Observers, SyncEvent, SyncObserver};
use crate::forest::Forest;
use crate::handler::SyncHandler;
use crate::messages::{EntityReply, IdListReply, RootHashes};
use crate::resolve::{resolve, Resolution};
use crate::state::CycleState;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Period of the automatic scheduler.
    pub sync_interval: Duration,
    /// Minimum spacing between passes.
    pub min_cycle_interval: Duration,
    /// Restarts allowed before automatic cycles are suspended.
    pub max_retries: u32,
    /// Delay after a pass starts before the single-flight flag is dropped.
    pub lock_release_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            min_cycle_interval: Duration::from_secs(2),
            max_retries: 3,
            lock_release_delay: Duration::from_millis(100),
        }
    }
}

/// Why a cycle did not run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    InProgress,
    TooSoon,
    Suspended,
    NoPeers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Every reachable peer agrees, or holds only less than we do.
    Converged { changed: bool, files_fetched: usize },
    /// The retry budget ran out before converging.
    Suspended { retries: u32 },
    /// A restart lost the single-flight flag to another cycle.
    Abandoned,
}

enum Pass {
    Converged,
    Restart,
}

pub struct SyncEngine {
    pub(crate) entities: Arc<dyn EntityStore>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) messenger: Arc<Messenger>,
    config: SyncConfig,
    state: Arc<CycleState>,
    pub(crate) observers: Observers,
    scheduler_enabled: AtomicBool,
}

impl SyncEngine {
    pub fn new<S>(store: Arc<S>, registry: Arc<PeerRegistry>, messenger: Arc<Messenger>, config: SyncConfig) -> Self
    where
        S: EntityStore + FileStore + 'static,
    {
        Self::from_parts(store.clone(), store, registry, messenger, config)
    }

    pub fn from_parts(
        entities: Arc<dyn EntityStore>,
        files: Arc<dyn FileStore>,
        registry: Arc<PeerRegistry>,
        messenger: Arc<Messenger>,
        config: SyncConfig,
    ) -> Self {
        Self {
            entities,
            files,
            registry,
            messenger,
            config,
            state: Arc::new(CycleState::new()),
            observers: Observers::default(),
            scheduler_enabled: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.add(observer);
    }

    /// Whether automatic cycles are suspended until [`force`](Self::force).
    pub fn is_suspended(&self) -> bool {
        self.state.retries() >= self.config.max_retries
    }

    /// Install the responder handlers for every sync action.
    pub fn register_handlers(&self, router: &Router) {
        SyncHandler::new(self.entities.clone(), self.files.clone()).register(router);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a cycle if the gates allow it.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.start(false).await
    }

    /// Reset the retry budget and run a cycle now, ignoring the minimum
    /// interval.
    pub async fn force(&self) -> Result<CycleOutcome> {
        self.state.reset_retries();
        self.start(true).await
    }

    /// Local data changed: reconcile soon.
    pub fn notify_local_change(self: &Arc<Self>) {
        self.spawn_cycle("local change");
    }

    /// A registry observer that starts a cycle whenever a peer is first seen.
    pub fn peer_trigger(self: &Arc<Self>) -> Arc<dyn PeerObserver> {
        Arc::new(PeerTrigger {
            engine: Arc::downgrade(self),
        })
    }

    pub fn set_scheduler_enabled(&self, enabled: bool) {
        self.scheduler_enabled.store(enabled, Ordering::Release);
    }

    /// Start the periodic scheduler.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.scheduler_enabled.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = engine.run_cycle().await {
                    warn!(error = %e, "scheduled sync cycle failed");
                }
            }
        })
    }

    fn spawn_cycle(self: &Arc<Self>, reason: &'static str) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_cycle().await {
                Ok(outcome) => debug!(reason, ?outcome, "triggered sync cycle done"),
                Err(e) => warn!(reason, error = %e, "triggered sync cycle failed"),
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cycle
    // ─────────────────────────────────────────────────────────────────────────

    fn gate(&self, forced: bool) -> std::result::Result<u64, SkipReason> {
        let generation = self.state.try_acquire().ok_or(SkipReason::InProgress)?;

        let since_last = now_millis().saturating_sub(self.state.last_cycle_ms());
        let min = self.config.min_cycle_interval.as_millis() as i64;
        let reason = if !forced && since_last < min {
            Some(SkipReason::TooSoon)
        } else if self.is_suspended() {
            Some(SkipReason::Suspended)
        } else if self.registry.list_active().is_empty() {
            Some(SkipReason::NoPeers)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.state.release_generation(generation);
                Err(reason)
            }
            None => Ok(generation),
        }
    }

    async fn start(&self, forced: bool) -> Result<CycleOutcome> {
        let mut generation = match self.gate(forced) {
            Ok(generation) => generation,
            Err(reason) => {
                debug!(?reason, "sync cycle skipped");
                return Ok(CycleOutcome::Skipped(reason));
            }
        };
        self.observers.emit(SyncEvent::CycleStarted);

        loop {
            match self.pass(generation).await {
                Err(e) => {
                    self.flush_changes();
                    self.state.release_generation(generation);
                    warn!(error = %e, "sync pass aborted");
                    return Err(e);
                }
                Ok(Pass::Converged) => return Ok(self.finish(generation).await),
                Ok(Pass::Restart) => {
                    let retries = self.state.bump_retries();
                    if retries >= self.config.max_retries {
                        self.flush_changes();
                        self.state.release_generation(generation);
                        warn!(retries, "sync not converging, suspending automatic cycles");
                        return Ok(CycleOutcome::Suspended { retries });
                    }
                    self.state.release_generation(generation);
                    self.wait_out_interval().await;
                    generation = match self.state.try_acquire() {
                        Some(generation) => generation,
                        None => {
                            debug!("restart superseded by a concurrent cycle");
                            return Ok(CycleOutcome::Abandoned);
                        }
                    };
                }
            }
        }
    }

    async fn wait_out_interval(&self) {
        let min = self.config.min_cycle_interval.as_millis() as i64;
        let elapsed = now_millis().saturating_sub(self.state.last_cycle_ms());
        if elapsed < min {
            tokio::time::sleep(Duration::from_millis((min - elapsed) as u64)).await;
        }
    }

    fn schedule_release(&self, generation: u64) {
        let state = self.state.clone();
        let delay = self.config.lock_release_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.release_generation(generation);
        });
    }

    async fn pass(&self, generation: u64) -> Result<Pass> {
        self.state.mark_started(now_millis());

        // Phase 1
        let forest = Forest::build(self.entities.as_ref()).await?;
        let peers: Vec<Peer> = self.registry.list_active();
        self.schedule_release(generation);

        let mut applied = false;
        let mut failures = Vec::new();
        for peer in &peers {
            match self.reconcile_with(&peer.address, &forest).await {
                Ok(changed) => applied |= changed,
                Err(e) => {
                    warn!(peer = %peer.address, error = %e, "reconciliation with peer failed");
                    failures.push(format!("{}: {e}", peer.address));
                }
            }
        }

        if !peers.is_empty() && failures.len() == peers.len() {
            return Err(SyncError::AllPeersFailed(failures.join("; ")));
        }
        Ok(if applied { Pass::Restart } else { Pass::Converged })
    }

    fn finish_events(&self, changed: bool) {
        if changed {
            self.observers.emit(SyncEvent::ContentChanged);
        }
        self.observers.emit(SyncEvent::CycleFinished { changed });
    }

    /// Report changes saved by passes of a cycle that ends without converging.
    fn flush_changes(&self) {
        if self.state.take_changes() {
            self.finish_events(true);
        }
    }

    async fn finish(&self, generation: u64) -> CycleOutcome {
        self.state.reset_retries();

        // Phase 6
        let files_fetched = match self.transfer_files().await {
            Ok(report) => report.fetched,
            Err(e) => {
                warn!(error = %e, "file transfer failed");
                0
            }
        };

        let changed = self.state.take_changes() || files_fetched > 0;
        self.finish_events(changed);
        self.state.release_generation(generation);
        info!(changed, files_fetched, "sync cycle converged");
        CycleOutcome::Converged {
            changed,
            files_fetched,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phases 2-5 against one peer
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn request<T: DeserializeOwned>(&self, peer: &PeerAddress, request: PeerRequest) -> Result<T> {
        let correlation_id = new_correlation_id();
        let response = self
            .messenger
            .call(peer, request.to_request()?, &correlation_id)
            .await?;
        Ok(response.decode_data()?)
    }

    /// Reconcile with one peer. Returns `true` if local content changed.
    async fn reconcile_with(&self, peer: &PeerAddress, forest: &Forest) -> Result<bool> {
        // Phase 2
        let remote: RootHashes = self.request(peer, PeerRequest::SyncCheckAll).await?;
        let roots = compare_roots(forest, &remote);
        for kind in &roots.synchronized {
            self.observers.emit(SyncEvent::KindSynchronized {
                kind: *kind,
                peer: peer.clone(),
            });
        }
        if roots.is_converged() {
            debug!(%peer, "roots match");
            return Ok(false);
        }

        let mut applied = false;
        for kind in roots.mismatched {
            let Some(tree) = forest.tree(kind) else {
                continue;
            };

            // Phase 3
            let ids: IdListReply = self
                .request(peer, PeerRequest::SyncGetIds(KindQuery { kind }))
                .await?;
            if ids.kind != kind {
                return Err(SyncError::InvalidPayload(format!(
                    "asked for {kind} ids, got {}",
                    ids.kind
                )));
            }
            let diff = diff_ids(tree, &ids.entries);
            debug!(
                %peer, %kind,
                missing = diff.missing.len(),
                differing = diff.differing.len(),
                local_only = diff.local_only,
                "id diff"
            );

            // Phase 4
            if !diff.missing.is_empty() {
                applied |= self.fetch_missing(peer, kind, &diff.missing).await?;
                continue;
            }

            // Phase 5
            if !diff.differing.is_empty() {
                applied |= self.resolve_conflicts(peer, kind, &diff.differing).await?;
                continue;
            }

            if diff.is_local_ahead() {
                debug!(%peer, %kind, "peer is behind, it will pull from us");
            }
        }
        Ok(applied)
    }

    async fn fetch_missing(&self, peer: &PeerAddress, kind: EntityKind, ids: &[EntityId]) -> Result<bool> {
        let mut changed = false;
        for id in ids {
            let query = EntityQuery {
                kind,
                id: *id,
                compare_content: false,
            };
            let reply: EntityReply = match self.request(peer, PeerRequest::SyncGetEntity(query)).await {
                Ok(reply) => reply,
                Err(SyncError::Net(NetError::Remote { message, .. })) => {
                    debug!(%peer, %kind, %id, %message, "peer no longer has entity");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let entity = reply.into_entity(kind)?;
            if entity.id() != *id {
                return Err(SyncError::InvalidPayload(format!(
                    "asked for {kind} {id}, got {}",
                    entity.id()
                )));
            }
            if self.entities.save(&entity).await? {
                self.state.flag_changes();
                changed = true;
            }
        }
        if changed {
            info!(%peer, %kind, fetched = ids.len(), "pulled missing entities");
        }
        Ok(changed)
    }

    async fn resolve_conflicts(&self, peer: &PeerAddress, kind: EntityKind, ids: &[EntityId]) -> Result<bool> {
        let mut changed = false;
        for id in ids {
            if !self.state.begin_comparison(kind, *id) {
                continue;
            }
            let outcome = self.compare_one(peer, kind, *id).await;
            self.state.end_comparison(kind, *id);
            changed |= outcome?;
        }
        Ok(changed)
    }

    async fn compare_one(&self, peer: &PeerAddress, kind: EntityKind, id: EntityId) -> Result<bool> {
        let query = EntityQuery {
            kind,
            id,
            compare_content: true,
        };
        let reply: EntityReply = self
            .request(peer, PeerRequest::SyncCompareEntity(query))
            .await?;
        let remote = reply.into_entity(kind)?;

        let accept = match self.entities.find_by_id(kind, &id).await? {
            None => true,
            Some(local) => match resolve(&local, &remote) {
                Resolution::AcceptRemote(rule) => {
                    debug!(%peer, %kind, %id, ?rule, "taking remote version");
                    true
                }
                Resolution::KeepLocal(rule) => {
                    debug!(%peer, %kind, %id, ?rule, "keeping local version");
                    false
                }
                Resolution::Identical => false,
            },
        };

        if accept && self.entities.save(&remote).await? {
            self.state.flag_changes();
            return Ok(true);
        }
        Ok(false)
    }
}

struct PeerTrigger {
    engine: Weak<SyncEngine>,
}

impl PeerObserver for PeerTrigger {
    fn on_peer_registered(&self, peer: &Peer) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        debug!(peer = %peer.address, "new peer, scheduling sync");
        engine.spawn_cycle("peer registered");
    }
}
