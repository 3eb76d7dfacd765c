//! Known peers and their liveness.
//!
//! The registry keeps at most one [`Peer`] per listening address. Ids are
//! stable once assigned: re-registering a known address refreshes the record
//! but never re-keys it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use chatmesh_core::{now_millis, Peer, PeerAddress, PeerId, PeerState};
use chatmesh_store::PeerStore;

use crate::messenger::ActivitySink;

/// Told about peers the registry has just learned of.
pub trait PeerObserver: Send + Sync {
    fn on_peer_registered(&self, peer: &Peer);
}

/// Outcome of [`PeerRegistry::register_or_update`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub peer: Peer,
    /// True if no record existed for this peer before.
    pub inserted: bool,
}

/// Peer counts per liveness state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<PeerId, Peer>,
    by_address: HashMap<PeerAddress, PeerId>,
}

impl RegistryInner {
    fn insert(&mut self, peer: Peer) {
        self.by_address.insert(peer.address.clone(), peer.id);
        self.peers.insert(peer.id, peer);
    }
}

pub struct PeerRegistry {
    local_id: PeerId,
    local_address: PeerAddress,
    inner: RwLock<RegistryInner>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
    store: Option<Arc<dyn PeerStore>>,
}

impl PeerRegistry {
    pub fn new(local_id: PeerId, local_address: PeerAddress) -> Self {
        Self {
            local_id,
            local_address,
            inner: RwLock::new(RegistryInner::default()),
            observers: RwLock::new(Vec::new()),
            store: None,
        }
    }

    /// Persist every change to `store`.
    pub fn with_store(mut self, store: Arc<dyn PeerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    pub fn is_self(&self, address: &PeerAddress) -> bool {
        *address == self.local_address
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or refresh the peer at `address`, marking it ONLINE.
    ///
    /// Returns `None` when `address` or `id` is this node.
    pub fn register_or_update(
        &self,
        address: &PeerAddress,
        id: Option<PeerId>,
        name: Option<String>,
    ) -> Option<Registration> {
        self.register_or_update_at(address, id, name, now_millis())
    }

    pub fn register_or_update_at(
        &self,
        address: &PeerAddress,
        id: Option<PeerId>,
        name: Option<String>,
        now: i64,
    ) -> Option<Registration> {
        if self.is_self(address) || id == Some(self.local_id) {
            return None;
        }

        let registration = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let existing = inner
                .by_address
                .get(address)
                .copied()
                .or_else(|| id.filter(|id| inner.peers.contains_key(id)));

            match existing.and_then(|known| inner.peers.get(&known).cloned()) {
                Some(mut peer) => {
                    if peer.address != *address {
                        inner.by_address.remove(&peer.address);
                        peer.address = address.clone();
                    }
                    peer.state = PeerState::Online;
                    peer.last_heartbeat = now;
                    if name.is_some() {
                        peer.name = name;
                    }
                    inner.insert(peer.clone());
                    Registration { peer, inserted: false }
                }
                None => {
                    let mut peer = Peer::online(id.unwrap_or_else(PeerId::random), address.clone(), now);
                    peer.name = name;
                    inner.insert(peer.clone());
                    Registration { peer, inserted: true }
                }
            }
        };

        if registration.inserted {
            info!(peer = %registration.peer.address, id = ?registration.peer.id, "registered peer");
            let observers = self
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for observer in observers {
                observer.on_peer_registered(&registration.peer);
            }
        }
        self.persist(&registration.peer);
        Some(registration)
    }

    /// Record a peer reported by another node.
    ///
    /// ONLINE reports refresh the peer like [`register_or_update`](Self::register_or_update).
    /// Any other report only adds an address we have never seen, keeping the
    /// reported state and heartbeat; local records are left alone.
    pub fn learn(&self, reported: &Peer) -> Option<Registration> {
        if reported.state == PeerState::Online {
            return self.register_or_update(&reported.address, Some(reported.id), reported.name.clone());
        }
        if self.is_self(&reported.address) || reported.id == self.local_id {
            return None;
        }

        let registration = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let existing = inner
                .by_address
                .get(&reported.address)
                .or_else(|| inner.peers.contains_key(&reported.id).then_some(&reported.id))
                .and_then(|id| inner.peers.get(id))
                .cloned();
            match existing {
                Some(peer) => Registration { peer, inserted: false },
                None => {
                    inner.insert(reported.clone());
                    Registration {
                        peer: reported.clone(),
                        inserted: true,
                    }
                }
            }
        };

        if registration.inserted {
            debug!(peer = %reported.address, state = ?reported.state, "learned of peer");
            self.persist(&registration.peer);
        }
        Some(registration)
    }

    /// Set a peer OFFLINE. The record is kept.
    pub fn mark_offline(&self, id: &PeerId) -> bool {
        let changed = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            match inner.peers.get_mut(id) {
                Some(peer) if peer.state != PeerState::Offline => {
                    peer.state = PeerState::Offline;
                    Some(peer.clone())
                }
                _ => None,
            }
        };
        match changed {
            Some(peer) => {
                info!(peer = %peer.address, "peer offline");
                self.persist(&peer);
                true
            }
            None => false,
        }
    }

    /// Refresh the heartbeat of an already known peer.
    pub fn touch(&self, address: &PeerAddress) -> bool {
        self.touch_at(address, now_millis())
    }

    pub fn touch_at(&self, address: &PeerAddress, now: i64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = inner.by_address.get(address).copied() else {
            return false;
        };
        match inner.peers.get_mut(&id) {
            Some(peer) => {
                peer.last_heartbeat = peer.last_heartbeat.max(now);
                if peer.state != PeerState::Online {
                    debug!(peer = %address, "peer back online");
                    peer.state = PeerState::Online;
                }
                true
            }
            None => false,
        }
    }

    /// Move ONLINE peers silent for longer than `timeout` to OFFLINE.
    /// Returns how many changed.
    pub fn sweep_timeouts(&self, timeout: Duration) -> usize {
        self.sweep_timeouts_at(timeout, now_millis())
    }

    pub fn sweep_timeouts_at(&self, timeout: Duration, now: i64) -> usize {
        let limit = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let expired: Vec<Peer> = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut expired = Vec::new();
            for peer in inner.peers.values_mut() {
                if peer.state != PeerState::Online {
                    continue;
                }
                if peer.last_heartbeat > now {
                    warn!(peer = %peer.address, last_heartbeat = peer.last_heartbeat, "heartbeat in the future, skipping");
                    continue;
                }
                if now.saturating_sub(peer.last_heartbeat) > limit {
                    peer.state = PeerState::Offline;
                    expired.push(peer.clone());
                }
            }
            expired
        };

        for peer in &expired {
            info!(peer = %peer.address, last_heartbeat = peer.last_heartbeat, "peer timed out");
            self.persist(peer);
        }
        expired.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peers
            .get(id)
            .cloned()
    }

    pub fn find_by_address(&self, address: &PeerAddress) -> Option<Peer> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_address
            .get(address)
            .and_then(|id| inner.peers.get(id))
            .cloned()
    }

    /// ONLINE peers, ordered by address.
    pub fn list_active(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peers
            .values()
            .filter(|p| p.is_online())
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Every known peer, ordered by address.
    pub fn list_all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peers
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub fn count_by_state(&self) -> StateCounts {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = StateCounts::default();
        for peer in inner.peers.values() {
            match peer.state {
                PeerState::Online => counts.online += 1,
                PeerState::Offline => counts.offline += 1,
                PeerState::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This node as a peer record.
    pub fn self_record(&self) -> Peer {
        Peer::online(self.local_id, self.local_address.clone(), now_millis())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Seed the registry from persisted peers. Loaded peers start UNKNOWN
    /// until heard from. Returns how many were loaded.
    pub async fn load_from(&self, store: &dyn PeerStore) -> chatmesh_store::Result<usize> {
        let peers = store.load_peers().await?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut loaded = 0;
        for mut peer in peers {
            if peer.address == self.local_address || peer.id == self.local_id {
                continue;
            }
            if inner.by_address.contains_key(&peer.address) {
                continue;
            }
            peer.state = PeerState::Unknown;
            inner.insert(peer);
            loaded += 1;
        }
        debug!(loaded, "peers restored");
        Ok(loaded)
    }

    fn persist(&self, peer: &Peer) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peer = peer.clone();
        runtime.spawn(async move {
            if let Err(e) = store.upsert_peer(&peer).await {
                warn!(peer = %peer.address, error = %e, "failed to persist peer");
            }
        });
    }
}

impl ActivitySink for PeerRegistry {
    fn on_activity(&self, address: &PeerAddress) {
        self.touch(address);
    }
}
