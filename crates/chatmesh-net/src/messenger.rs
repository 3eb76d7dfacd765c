//! Outbound sends, correlated calls and the inbound reader loops.
//!
//! The [`Messenger`] owns nothing but handles: the pools, the router and a
//! connector. Everything that talks to a peer goes through it.
//!
//! ## Correlated calls
//!
//! [`Messenger::call`] registers a one-shot response route under
//! `action:correlationId`, sends the request and waits. The response path
//! and the timeout path race for the route; whichever removes it first
//! decides the outcome, so a call resolves exactly once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use chatmesh_core::{now_millis, PeerAddress};

use crate::connector::{ConnectConfig, Connector};
use crate::error::{NetError, Result};
use crate::pool::{PoolKind, Pools};
use crate::router::{correlated_key, OneShot, RequestContext, Router};
use crate::session::Session;
use crate::wire::{Request, Response, WireMessage, CORRELATION_KEY};

/// Payload field that pins a request to one destination.
pub const TARGET_KEY: &str = "targetAddress";

/// How long the reader supervisor waits for an unread session per poll.
const SUPERVISOR_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MessengerConfig {
    /// Deadline for a correlated call.
    pub call_timeout: Duration,
    /// How long a send waits for a pooled session.
    pub checkout_timeout: Duration,
    pub connect: ConnectConfig,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(6),
            checkout_timeout: Duration::from_millis(1500),
            connect: ConnectConfig::default(),
        }
    }
}

/// Notified whenever a message arrives from a peer.
pub trait ActivitySink: Send + Sync {
    fn on_activity(&self, address: &PeerAddress);
}

/// An outstanding correlated call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCall {
    pub action: String,
    pub correlation_id: String,
    pub target: PeerAddress,
    pub started_at: i64,
}

pub struct Messenger {
    pools: Arc<Pools>,
    router: Arc<Router>,
    connector: Connector,
    config: MessengerConfig,
    pending: Mutex<HashMap<String, PendingCall>>,
    activity: RwLock<Option<Arc<dyn ActivitySink>>>,
    closed: AtomicBool,
}

impl Messenger {
    pub fn new(pools: Arc<Pools>, router: Arc<Router>, config: MessengerConfig) -> Self {
        Self {
            pools,
            router,
            connector: Connector::new(config.connect.clone()),
            config,
            pending: Mutex::new(HashMap::new()),
            activity: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Install the sink told about inbound traffic (usually the peer registry).
    pub fn set_activity_sink(&self, sink: Arc<dyn ActivitySink>) {
        *self.activity.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn activity_sink(&self) -> Option<Arc<dyn ActivitySink>> {
        self.activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    async fn write<T: Serialize>(&self, session: &Session, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)?;
        trace!(peer = %session.effective_address(), %line, "send");
        session.write_line(&line).await
    }

    /// Send over any session of `pool`, or over the session for the
    /// payload's `targetAddress` when it names one.
    pub async fn send(&self, request: &Request, pool: PoolKind) -> Result<()> {
        if let Some(target) = request.payload_field(TARGET_KEY).and_then(parse_target) {
            return self.send_to(&target, request, pool).await;
        }
        let pool = self.pools.get(pool);
        let session = pool.checkout(self.config.checkout_timeout).await?;
        let result = self.write(&session, request).await;
        pool.checkin(session);
        if let Err(e) = &result {
            warn!(action = %request.action, error = %e, "send failed");
        }
        result
    }

    /// Send only over a session reaching `address`.
    pub async fn send_to(&self, address: &PeerAddress, request: &Request, pool: PoolKind) -> Result<()> {
        let pool = self.pools.get(pool);
        let session = pool
            .checkout_by_address(address, self.config.checkout_timeout)
            .await?;
        let result = self.write(&session, request).await;
        pool.checkin(session);
        if let Err(e) = &result {
            warn!(peer = %address, action = %request.action, error = %e, "send failed");
        }
        result
    }

    /// Send to every distinct peer address in `pool`. Returns how many
    /// deliveries succeeded.
    pub async fn broadcast(&self, request: &Request, pool: PoolKind) -> usize {
        let targets: BTreeSet<PeerAddress> = self
            .pools
            .get(pool)
            .snapshot()
            .iter()
            .map(|s| s.effective_address())
            .collect();

        let mut delivered = 0;
        for target in &targets {
            match self.send_to(target, request, pool).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %target, action = %request.action, error = %e, "broadcast miss"),
            }
        }
        delivered
    }

    /// Make sure a session to `address` exists in `pool`, connecting if needed.
    pub async fn ensure_session(self: &Arc<Self>, address: &PeerAddress, pool: PoolKind) -> Result<()> {
        if self.pools.get(pool).has_session_for(address) {
            return Ok(());
        }
        let session = self.connector.connect(address).await?;
        self.attach(Arc::new(session), pool);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Correlated calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Send `request` to `address` and wait for the response carrying
    /// `correlation_id`.
    ///
    /// The id is stamped into the payload unless the payload already
    /// carries one; responders echo it back.
    ///
    /// Error-status responses are returned as `Ok`; callers decide what an
    /// error status means for them.
    pub async fn call(
        self: &Arc<Self>,
        address: &PeerAddress,
        mut request: Request,
        correlation_id: &str,
    ) -> Result<Response> {
        stamp_correlation(&mut request.payload, correlation_id);
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(correlation_id) {
                return Err(NetError::DuplicateCorrelation(correlation_id.to_string()));
            }
            pending.insert(
                correlation_id.to_string(),
                PendingCall {
                    action: request.action.clone(),
                    correlation_id: correlation_id.to_string(),
                    target: address.clone(),
                    started_at: now_millis(),
                },
            );
        }

        let key = correlated_key(&request.action, correlation_id);
        let (handler, mut rx) = OneShot::channel();
        self.router.register_response_handler(&key, handler);

        let timeout = || NetError::Timeout {
            action: request.action.clone(),
        };

        let sent = match self.ensure_session(address, PoolKind::Peers).await {
            Ok(()) => self.send_to(address, &request, PoolKind::Peers).await,
            Err(e) => Err(e),
        };

        let result = match sent {
            Err(e) => {
                self.router.remove_response_handler(&key);
                Err(e)
            }
            Ok(()) => match tokio::time::timeout(self.config.call_timeout, &mut rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(timeout()),
                Err(_) => {
                    if self.router.remove_response_handler(&key) {
                        debug!(peer = %address, action = %request.action, correlation_id, "call timed out");
                        Err(timeout())
                    } else {
                        // The response path won the race and is delivering.
                        rx.await.map_err(|_| timeout())
                    }
                }
            },
        };

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
        result
    }

    /// Snapshot of outstanding correlated calls.
    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a session to `pool` and start reading from it.
    pub fn attach(self: &Arc<Self>, session: Arc<Session>, pool: PoolKind) {
        self.pools.get(pool).add(session.clone());
        if session.try_claim_reader() {
            self.spawn_read_loop(session, pool);
        }
    }

    /// Start the reader supervisor for `pool`: any session that ends up in
    /// the pool without a reader gets one.
    pub fn spawn_reader(self: &Arc<Self>, pool: PoolKind) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            debug!(%pool, "reader supervisor started");
            while !this.closed.load(Ordering::Acquire) {
                let sessions = this.pools.get(pool);
                match sessions
                    .checkout_matching(|s| !s.has_reader(), SUPERVISOR_POLL)
                    .await
                {
                    Ok(session) => {
                        if session.try_claim_reader() {
                            this.spawn_read_loop(session.clone(), pool);
                        }
                        sessions.checkin(session);
                    }
                    Err(_) => continue,
                }
            }
            debug!(%pool, "reader supervisor stopped");
        })
    }

    fn spawn_read_loop(self: &Arc<Self>, session: Arc<Session>, pool: PoolKind) {
        let this = self.clone();
        tokio::spawn(async move { this.read_loop(session, pool).await });
    }

    async fn read_loop(self: Arc<Self>, session: Arc<Session>, pool: PoolKind) {
        let ctx = RequestContext::new(session.clone(), pool);
        debug!(peer = %session.remote(), %pool, "reader attached");

        loop {
            let line = match session.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(peer = %session.effective_address(), "session closed by remote");
                    break;
                }
                Err(e) => {
                    debug!(peer = %session.effective_address(), error = %e, "read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match WireMessage::parse(&line) {
                Ok(WireMessage::Request(request)) => {
                    let this = self.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let response = this.router.dispatch_request(request, &ctx).await;
                        if let Some(sink) = this.activity_sink() {
                            sink.on_activity(&ctx.sender());
                        }
                        if let Err(e) = this.write(&ctx.session, &response).await {
                            warn!(peer = %ctx.sender(), action = %response.action, error = %e, "reply failed");
                        }
                    });
                }
                Ok(WireMessage::Response(response)) => {
                    if let Some(sink) = self.activity_sink() {
                        sink.on_activity(&ctx.sender());
                    }
                    let this = self.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        this.router.dispatch_response(response, &ctx).await;
                    });
                }
                Err(e) => {
                    warn!(peer = %session.effective_address(), error = %e, "dropping malformed message");
                }
            }
        }

        session.close();
        session.release_reader();
        self.pools.get(pool).remove(session.id());
    }

    /// Stop supervisors and close every session.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.pools.get(PoolKind::Peers).close_all();
        self.pools.get(PoolKind::Clients).close_all();
    }
}

/// Insert `correlationId` into an object (or absent) JSON value, leaving an
/// existing id alone.
pub(crate) fn stamp_correlation(slot: &mut Option<Value>, correlation_id: &str) {
    match slot {
        None | Some(Value::Null) => {
            let mut map = serde_json::Map::new();
            map.insert(CORRELATION_KEY.to_string(), Value::String(correlation_id.to_string()));
            *slot = Some(Value::Object(map));
        }
        Some(Value::Object(map)) => {
            map.entry(CORRELATION_KEY)
                .or_insert_with(|| Value::String(correlation_id.to_string()));
        }
        Some(_) => {}
    }
}

fn parse_target(value: &Value) -> Option<PeerAddress> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ActionHandler, ResponseHandler};
    use crate::action::PeerRequest;
    use async_trait::async_trait;
    use serde_json::json;

    fn messenger() -> Arc<Messenger> {
        let config = MessengerConfig {
            call_timeout: Duration::from_millis(200),
            checkout_timeout: Duration::from_millis(50),
            connect: ConnectConfig {
                retries: 1,
                backoff: Duration::from_millis(1),
                attempt_timeout: Duration::from_millis(100),
            },
        };
        Arc::new(Messenger::new(Arc::new(Pools::new()), Arc::new(Router::new()), config))
    }

    /// Attach one end of a pipe to `m` and hand back the far end.
    fn wire_up(m: &Arc<Messenger>, remote: PeerAddress) -> Arc<Session> {
        let (mine, theirs) = Session::pair(PeerAddress::new("127.0.0.1", 1), remote);
        m.attach(Arc::new(mine), PoolKind::Peers);
        Arc::new(theirs)
    }

    #[tokio::test]
    async fn test_send_checks_session_back_in() {
        let m = messenger();
        let far = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        m.send(&Request::new("heartbeat", None), PoolKind::Peers)
            .await
            .unwrap();
        assert_eq!(m.pools.get(PoolKind::Peers).available(), 1);
        let line = far.read_line().await.unwrap().unwrap();
        assert!(line.contains("heartbeat"));
    }

    #[tokio::test]
    async fn test_failed_send_still_checks_in() {
        let m = messenger();
        let (mine, theirs) = Session::pair(PeerAddress::new("127.0.0.1", 1), PeerAddress::new("10.0.0.2", 7000));
        // Pool the session without a reader so nothing removes it.
        let mine = Arc::new(mine);
        m.pools.get(PoolKind::Peers).add(mine.clone());
        drop(theirs);
        let err = m.send(&Request::new("heartbeat", None), PoolKind::Peers).await;
        assert!(err.is_err());
        assert_eq!(m.pools.get(PoolKind::Peers).available(), 1);
    }

    #[tokio::test]
    async fn test_send_honours_target_address() {
        let m = messenger();
        let _a = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        let b = wire_up(&m, PeerAddress::new("10.0.0.3", 7000));
        let request = Request::new("peer-push", Some(json!({"targetAddress": "10.0.0.3:7000"})));
        m.send(&request, PoolKind::Peers).await.unwrap();
        assert!(b.read_line().await.unwrap().unwrap().contains("peer-push"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_address_is_no_session() {
        let m = messenger();
        let err = m
            .send_to(&PeerAddress::new("10.0.0.9", 1), &Request::new("x", None), PoolKind::Peers)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NoSession { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_each_address() {
        let m = messenger();
        let a = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        let b = wire_up(&m, PeerAddress::new("10.0.0.3", 7000));
        let n = m.broadcast(&Request::new("sync-check-all", None), PoolKind::Peers).await;
        assert_eq!(n, 2);
        assert!(a.read_line().await.unwrap().is_some());
        assert!(b.read_line().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let m = messenger();
        let target = PeerAddress::new("10.0.0.2", 7000);
        let far = wire_up(&m, target.clone());

        let responder = tokio::spawn(async move {
            let line = far.read_line().await.unwrap().unwrap();
            assert!(line.contains("peer-list"));
            let reply = Response::success("peer-list", "ok", Some(json!({"correlationId": "c7", "peers": []})));
            far.write_line(&serde_json::to_string(&reply).unwrap()).await.unwrap();
        });

        let response = m
            .call(&target, Request::new("peer-list", None), "c7")
            .await
            .unwrap();
        assert_eq!(response.correlation_id(), Some("c7"));
        responder.await.unwrap();
        assert!(m.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_call_times_out_once() {
        let m = messenger();
        let target = PeerAddress::new("10.0.0.2", 7000);
        let far = wire_up(&m, target.clone());

        let err = m
            .call(&target, Request::new("peer-list", None), "late")
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout { .. }));
        assert!(!m.router.remove_response_handler("peer-list:late"));

        // A late response finds no route and is dropped.
        let reply = Response::success("peer-list", "ok", Some(json!({"correlationId": "late"})));
        far.write_line(&serde_json::to_string(&reply).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(m.pending_calls().is_empty());
    }

    #[test]
    fn test_stamp_correlation() {
        let mut empty = None;
        stamp_correlation(&mut empty, "c1");
        assert_eq!(empty, Some(json!({"correlationId": "c1"})));

        let mut existing = Some(json!({"type": "user", "correlationId": "mine"}));
        stamp_correlation(&mut existing, "c2");
        assert_eq!(existing, Some(json!({"type": "user", "correlationId": "mine"})));
    }

    #[tokio::test]
    async fn test_duplicate_correlation_rejected() {
        let m = messenger();
        let target = PeerAddress::new("10.0.0.2", 7000);
        let _far = wire_up(&m, target.clone());

        let first = {
            let m = m.clone();
            let target = target.clone();
            tokio::spawn(async move { m.call(&target, Request::new("peer-list", None), "dup").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = m.call(&target, Request::new("peer-list", None), "dup").await;
        assert!(matches!(second, Err(NetError::DuplicateCorrelation(_))));
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_call_without_route_fails_fast() {
        let m = messenger();
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = m
            .call(&PeerAddress::new("127.0.0.1", port), Request::new("peer-join", None), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { .. }));
        assert!(m.pending_calls().is_empty());
    }

    struct Pong;

    #[async_trait]
    impl ActionHandler for Pong {
        async fn handle(&self, request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
            Ok(Response::success(request.action(), "pong", None))
        }
    }

    #[tokio::test]
    async fn test_inbound_request_answered_on_same_session() {
        let m = messenger();
        m.router.register_action_handler("sync-check-all", Arc::new(Pong));
        let far = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        far.write_line(r#"{"action":"sync-check-all","payload":null}"#)
            .await
            .unwrap();
        let reply = far.read_line().await.unwrap().unwrap();
        match WireMessage::parse(&reply).unwrap() {
            WireMessage::Response(r) => assert_eq!(r.message, "pong"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_reader() {
        let m = messenger();
        let far = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        far.write_line("{not json").await.unwrap();
        far.write_line(r#"{"action":"no-such-thing"}"#).await.unwrap();
        let reply = far.read_line().await.unwrap().unwrap();
        assert!(reply.contains("unknown action"));
    }

    #[tokio::test]
    async fn test_eof_removes_session() {
        let m = messenger();
        let far = wire_up(&m, PeerAddress::new("10.0.0.2", 7000));
        drop(far);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(m.pools.get(PoolKind::Peers).is_empty());
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<PeerAddress>>);

    impl ActivitySink for Seen {
        fn on_activity(&self, address: &PeerAddress) {
            self.0.lock().unwrap().push(address.clone());
        }
    }

    struct Ignore;

    #[async_trait]
    impl ResponseHandler for Ignore {
        async fn on_response(&self, _response: Response, _ctx: &RequestContext) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inbound_traffic_reported_to_sink() {
        let m = messenger();
        let seen = Arc::new(Seen::default());
        m.set_activity_sink(seen.clone());
        m.router.register_response_handler("heartbeat", Arc::new(Ignore));
        let remote = PeerAddress::new("10.0.0.2", 7000);
        let far = wire_up(&m, remote.clone());
        far.write_line(r#"{"action":"heartbeat","status":"success","message":"ok","data":null}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.0.lock().unwrap().as_slice(), &[remote]);
    }

    #[tokio::test]
    async fn test_oversized_record_drops_session() {
        let m = messenger();
        let (mine, theirs) = Session::pair(PeerAddress::new("127.0.0.1", 1), PeerAddress::new("10.0.0.2", 7000));
        m.attach(Arc::new(mine.with_max_line(256)), PoolKind::Peers);
        assert_eq!(m.pools.get(PoolKind::Peers).len(), 1);

        theirs.write_line(&"x".repeat(4096)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(m.pools.get(PoolKind::Peers).is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_reads_pooled_sessions() {
        let m = messenger();
        m.router.register_action_handler("sync-check-all", Arc::new(Pong));
        let handle = m.spawn_reader(PoolKind::Peers);
        let (mine, theirs) = Session::pair(PeerAddress::new("127.0.0.1", 1), PeerAddress::new("10.0.0.2", 7000));
        m.pools.get(PoolKind::Peers).add(Arc::new(mine));
        theirs
            .write_line(r#"{"action":"sync-check-all"}"#)
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), theirs.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(reply.contains("pong"));
        m.shutdown();
        handle.abort();
    }
}
