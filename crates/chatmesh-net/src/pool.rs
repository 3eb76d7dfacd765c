//! Connection pools.
//!
//! A pool is a blocking multiset of sessions. Callers check a session out,
//! use it, and must check it back in on every path. Checkout waits up to a
//! deadline and reports [`NetError::NoSession`] rather than an empty value.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use chatmesh_core::PeerAddress;

use crate::error::{NetError, Result};
use crate::session::{Session, SessionId};

/// The two independent traffic classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Server-to-server replication traffic.
    Peers,
    /// Client-to-server traffic.
    Clients,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Peers => f.write_str("peers"),
            PoolKind::Clients => f.write_str("clients"),
        }
    }
}

pub struct ConnectionPool {
    kind: PoolKind,
    inner: Mutex<PoolInner>,
    available_changed: Notify,
}

#[derive(Default)]
struct PoolInner {
    members: HashMap<SessionId, Arc<Session>>,
    available: VecDeque<SessionId>,
}

impl PoolInner {
    fn take_matching<F>(&mut self, pred: &F) -> Option<Arc<Session>>
    where
        F: Fn(&Session) -> bool,
    {
        let mut dead = Vec::new();
        let mut found = None;
        for (pos, id) in self.available.iter().enumerate() {
            match self.members.get(id) {
                Some(s) if !s.is_active() => dead.push(*id),
                Some(s) if pred(s) => {
                    found = Some(pos);
                    break;
                }
                Some(_) => {}
                None => dead.push(*id),
            }
        }
        let taken = found
            .and_then(|pos| self.available.remove(pos))
            .and_then(|id| self.members.get(&id).cloned());
        for id in dead {
            self.members.remove(&id);
            self.available.retain(|a| *a != id);
        }
        taken
    }
}

impl ConnectionPool {
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(PoolInner::default()),
            available_changed: Notify::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new session, immediately available.
    pub fn add(&self, session: Arc<Session>) {
        {
            let mut inner = self.lock();
            let id = session.id();
            if inner.members.insert(id, session).is_none() {
                inner.available.push_back(id);
            }
        }
        self.available_changed.notify_waiters();
    }

    /// Block up to `timeout` for any active session.
    pub async fn checkout(&self, timeout: Duration) -> Result<Arc<Session>> {
        self.checkout_matching(|_| true, timeout)
            .await
            .map_err(|_| NetError::NoSession {
                pool: self.kind,
                address: None,
            })
    }

    /// Block up to `timeout` for a session reaching `address`.
    pub async fn checkout_by_address(
        &self,
        address: &PeerAddress,
        timeout: Duration,
    ) -> Result<Arc<Session>> {
        self.checkout_matching(|s| s.matches(address), timeout)
            .await
            .map_err(|_| NetError::NoSession {
                pool: self.kind,
                address: Some(address.clone()),
            })
    }

    /// Block up to `timeout` for a session satisfying `pred`.
    pub async fn checkout_matching<F>(&self, pred: F, timeout: Duration) -> Result<Arc<Session>>
    where
        F: Fn(&Session) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.lock().take_matching(&pred) {
                return Ok(session);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NetError::NoSession {
                    pool: self.kind,
                    address: None,
                });
            }
        }
    }

    /// Return a checked-out session. Inactive sessions are dropped instead.
    pub fn checkin(&self, session: Arc<Session>) {
        {
            let mut inner = self.lock();
            let id = session.id();
            if !session.is_active() {
                inner.members.remove(&id);
                inner.available.retain(|a| *a != id);
            } else if inner.members.contains_key(&id) && !inner.available.contains(&id) {
                inner.available.push_back(id);
            }
        }
        self.available_changed.notify_waiters();
    }

    /// Forget a session entirely.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut inner = self.lock();
        inner.available.retain(|a| *a != id);
        inner.members.remove(&id).is_some()
    }

    /// Every active member, checked out or not.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.lock()
            .members
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn has_session_for(&self, address: &PeerAddress) -> bool {
        self.lock()
            .members
            .values()
            .any(|s| s.is_active() && s.matches(address))
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions currently checked in.
    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    /// Close and drop every session.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        for session in inner.members.values() {
            session.close();
        }
        inner.members.clear();
        inner.available.clear();
    }
}

/// One pool per traffic class.
pub struct Pools {
    peers: ConnectionPool,
    clients: ConnectionPool,
}

impl Pools {
    pub fn new() -> Self {
        Self {
            peers: ConnectionPool::new(PoolKind::Peers),
            clients: ConnectionPool::new(PoolKind::Clients),
        }
    }

    pub fn get(&self, kind: PoolKind) -> &ConnectionPool {
        match kind {
            PoolKind::Peers => &self.peers,
            PoolKind::Clients => &self.clients,
        }
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(to: PeerAddress) -> (Arc<Session>, Session) {
        let (mine, theirs) = Session::pair(PeerAddress::new("local", 1), to);
        (Arc::new(mine), theirs)
    }

    #[tokio::test]
    async fn test_checkout_times_out_when_empty() {
        let pool = ConnectionPool::new(PoolKind::Peers);
        let err = pool.checkout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, NetError::NoSession { pool: PoolKind::Peers, address: None }));
    }

    #[tokio::test]
    async fn test_checkout_is_exclusive_until_checkin() {
        let pool = ConnectionPool::new(PoolKind::Peers);
        let (s, _peer) = session(PeerAddress::new("10.0.0.2", 7000));
        pool.add(s);

        let first = pool.checkout(Duration::from_millis(20)).await.unwrap();
        assert!(pool.checkout(Duration::from_millis(20)).await.is_err());
        pool.checkin(first);
        assert!(pool.checkout(Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkout_by_address() {
        let pool = ConnectionPool::new(PoolKind::Peers);
        let target = PeerAddress::new("10.0.0.3", 7000);
        let (a, _pa) = session(PeerAddress::new("10.0.0.2", 7000));
        let (b, _pb) = session(target.clone());
        pool.add(a);
        pool.add(b.clone());

        let got = pool
            .checkout_by_address(&target, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(got.id(), b.id());

        let missing = PeerAddress::new("10.0.0.9", 7000);
        let err = pool
            .checkout_by_address(&missing, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NoSession { address: Some(a), .. } if a == missing));
    }

    #[tokio::test]
    async fn test_blocked_checkout_wakes_on_checkin() {
        let pool = Arc::new(ConnectionPool::new(PoolKind::Clients));
        let (s, _peer) = session(PeerAddress::new("10.0.0.2", 7000));
        pool.add(s);
        let held = pool.checkout(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.checkin(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_inactive_sessions_are_dropped() {
        let pool = ConnectionPool::new(PoolKind::Peers);
        let (s, _peer) = session(PeerAddress::new("10.0.0.2", 7000));
        pool.add(s.clone());
        s.close();
        assert!(pool.checkout(Duration::from_millis(10)).await.is_err());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_checkin_of_closed_session_removes_it() {
        let pool = ConnectionPool::new(PoolKind::Peers);
        let (s, _peer) = session(PeerAddress::new("10.0.0.2", 7000));
        pool.add(s);
        let held = pool.checkout(Duration::from_millis(10)).await.unwrap();
        held.close();
        pool.checkin(held);
        assert_eq!(pool.len(), 0);
    }
}
