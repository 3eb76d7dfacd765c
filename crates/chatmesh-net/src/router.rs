//! Request/response routing tables.
//!
//! ## Message Flow
//!
//! ```text
//! inbound line ──► WireMessage::parse
//!                    │
//!        ┌───────────┴────────────┐
//!        ▼                        ▼
//!     Request                  Response
//!        │                        │
//!  action table            "action:correlationId" (one-shot)
//!  (case-insensitive)             │ else
//!        │                  "action" (persistent)
//!        ▼                        │ else
//!  Response written back      logged and dropped
//!  on the same session
//! ```
//!
//! Handlers run on their own task so a panicking handler is reported as an
//! error response (requests) or a log line (responses) and never takes the
//! reader loop down with it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use chatmesh_core::PeerAddress;

use crate::action::PeerRequest;
use crate::error::Result;
use crate::messenger::stamp_correlation;
use crate::pool::PoolKind;
use crate::session::Session;
use crate::wire::{Request, Response, CORRELATION_KEY};

/// Where an inbound message came from.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The session the message arrived on; replies go back through it.
    pub session: Arc<Session>,
    pub pool: PoolKind,
}

impl RequestContext {
    pub fn new(session: Arc<Session>, pool: PoolKind) -> Self {
        Self { session, pool }
    }

    /// Best known listening address of the sender.
    pub fn sender(&self) -> PeerAddress {
        self.session.effective_address()
    }
}

/// Handles one request action and produces the reply.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: PeerRequest, ctx: &RequestContext) -> Result<Response>;
}

/// Receives responses routed to its key.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_response(&self, response: Response, ctx: &RequestContext) -> Result<()>;
}

/// Completes a oneshot channel with the first response it receives.
pub struct OneShot {
    tx: std::sync::Mutex<Option<oneshot::Sender<Response>>>,
}

impl OneShot {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: std::sync::Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ResponseHandler for OneShot {
    async fn on_response(&self, response: Response, _ctx: &RequestContext) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(response);
        }
        Ok(())
    }
}

#[derive(Clone)]
enum ResponseRoute {
    Persistent(Arc<dyn ResponseHandler>),
    Once(Arc<dyn ResponseHandler>),
}

/// Normalize a route key: the action part is case-insensitive, a
/// correlation id suffix is kept verbatim.
fn route_key(key: &str) -> String {
    match key.split_once(':') {
        Some((action, correlation)) => format!("{}:{}", action.to_ascii_lowercase(), correlation),
        None => key.to_ascii_lowercase(),
    }
}

/// Key of the one-shot route for a specific outstanding call.
pub fn correlated_key(action: &str, correlation_id: &str) -> String {
    route_key(&format!("{action}:{correlation_id}"))
}

/// Action and response handler tables.
#[derive(Default)]
pub struct Router {
    actions: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    responses: RwLock<HashMap<String, ResponseRoute>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Install the handler for `action`, replacing any previous one.
    pub fn register_action_handler(&self, action: &str, handler: Arc<dyn ActionHandler>) {
        let key = action.to_ascii_lowercase();
        let previous = self
            .actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler);
        if previous.is_some() {
            debug!(action, "replaced action handler");
        }
    }

    /// Install a response handler.
    ///
    /// A bare action key stays installed; an `action:correlationId` key is
    /// removed on its first invocation.
    pub fn register_response_handler(&self, key: &str, handler: Arc<dyn ResponseHandler>) {
        let key = route_key(key);
        let route = if key.contains(':') {
            ResponseRoute::Once(handler)
        } else {
            ResponseRoute::Persistent(handler)
        };
        self.responses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, route);
    }

    /// Remove a response route. Returns `false` if it was already gone.
    pub fn remove_response_handler(&self, key: &str) -> bool {
        self.responses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&route_key(key))
            .is_some()
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&action.to_ascii_lowercase())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Route a request to its handler and produce the reply. A correlation
    /// id in the request payload is echoed in the reply data.
    pub async fn dispatch_request(&self, request: Request, ctx: &RequestContext) -> Response {
        let correlation = request
            .payload_field(CORRELATION_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let mut response = self.route_request(request, ctx).await;
        if let Some(correlation) = correlation {
            stamp_correlation(&mut response.data, &correlation);
        }
        response
    }

    async fn route_request(&self, request: Request, ctx: &RequestContext) -> Response {
        let handler = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.action.to_ascii_lowercase())
            .cloned();
        let Some(handler) = handler else {
            debug!(action = %request.action, "no handler for action");
            return Response::error(&request.action, format!("unknown action: {}", request.action));
        };

        let decoded = match PeerRequest::decode(&request) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(action = %request.action, error = %e, "rejecting request");
                return Response::error(&request.action, e.to_string());
            }
        };
        if let Some(address) = decoded.sender_address() {
            ctx.session.advertise(address);
        }

        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler.handle(decoded, &task_ctx).await }).await;
        match joined {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(action = %request.action, error = %e, "handler failed");
                Response::error(&request.action, format!("internal error: {e}"))
            }
            Err(e) => {
                warn!(action = %request.action, error = %e, "handler panicked");
                Response::error(&request.action, "internal error: handler panicked")
            }
        }
    }

    /// Route a response to its handler. Returns `false` if nothing took it.
    pub async fn dispatch_response(&self, response: Response, ctx: &RequestContext) -> bool {
        let Some(handler) = self.take_route(&response) else {
            debug!(action = %response.action, status = ?response.status, "dropping unrouted response");
            return false;
        };

        let action = response.action.clone();
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler.on_response(response, &task_ctx).await }).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%action, error = %e, "response handler failed"),
            Err(e) => warn!(%action, error = %e, "response handler panicked"),
        }
        true
    }

    fn take_route(&self, response: &Response) -> Option<Arc<dyn ResponseHandler>> {
        let action = response.action.to_ascii_lowercase();
        let mut routes = self.responses.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(correlation) = response.correlation_id() {
            let key = correlated_key(&action, correlation);
            match routes.get(&key) {
                Some(ResponseRoute::Once(_)) => {
                    if let Some(ResponseRoute::Once(h)) = routes.remove(&key) {
                        return Some(h);
                    }
                }
                Some(ResponseRoute::Persistent(h)) => return Some(h.clone()),
                None => {}
            }
        }

        match routes.get(&action) {
            Some(ResponseRoute::Persistent(h)) | Some(ResponseRoute::Once(h)) => Some(h.clone()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Heartbeat;
    use crate::error::NetError;
    use chatmesh_core::PeerId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn handle(&self, request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
            Ok(Response::success(request.action(), "echo", None))
        }
    }

    struct Boom;

    #[async_trait]
    impl ActionHandler for Boom {
        async fn handle(&self, _request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
            panic!("handler bug");
        }
    }

    struct Failing;

    #[async_trait]
    impl ActionHandler for Failing {
        async fn handle(&self, _request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
            Err(NetError::Protocol("peer not found".into()))
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl ResponseHandler for Counter {
        async fn on_response(&self, _response: Response, _ctx: &RequestContext) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx() -> RequestContext {
        let (s, _other) = Session::pair(PeerAddress::new("me", 1), PeerAddress::new("10.0.0.5", 50000));
        RequestContext::new(Arc::new(s), PoolKind::Peers)
    }

    fn heartbeat_request(action: &str) -> Request {
        let hb = Heartbeat {
            peer_id: PeerId::from_bytes([1; 16]),
            address: PeerAddress::new("10.0.0.5", 9001),
        };
        Request::new(action, Some(serde_json::to_value(hb).unwrap()))
    }

    #[tokio::test]
    async fn test_action_lookup_is_case_insensitive() {
        let router = Router::new();
        router.register_action_handler("HeartBeat", Arc::new(Echo));
        let ctx = ctx();
        let response = router.dispatch_request(heartbeat_request("HEARTBEAT"), &ctx).await;
        assert!(response.is_success());
        assert_eq!(response.message, "echo");
        // Sender's announced address is learned.
        assert!(ctx.session.matches(&PeerAddress::new("10.0.0.5", 9001)));
    }

    #[tokio::test]
    async fn test_unknown_action_answers_error() {
        let router = Router::new();
        let response = router
            .dispatch_request(Request::new("list-members", None), &ctx())
            .await;
        assert!(!response.is_success());
        assert!(response.message.contains("unknown action"));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_response() {
        let router = Router::new();
        router.register_action_handler("heartbeat", Arc::new(Boom));
        let response = router.dispatch_request(heartbeat_request("heartbeat"), &ctx()).await;
        assert!(!response.is_success());
        assert!(response.message.starts_with("internal error"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let router = Router::new();
        router.register_action_handler("heartbeat", Arc::new(Failing));
        let response = router.dispatch_request(heartbeat_request("heartbeat"), &ctx()).await;
        assert!(!response.is_success());
        assert!(response.message.contains("peer not found"));
    }

    #[tokio::test]
    async fn test_correlation_echoed_on_errors_too() {
        let router = Router::new();
        router.register_action_handler("heartbeat", Arc::new(Failing));
        let mut request = heartbeat_request("heartbeat");
        if let Some(serde_json::Value::Object(map)) = request.payload.as_mut() {
            map.insert("correlationId".into(), json!("c9"));
        }
        let response = router.dispatch_request(request, &ctx()).await;
        assert!(!response.is_success());
        assert_eq!(response.correlation_id(), Some("c9"));
    }

    #[tokio::test]
    async fn test_bad_payload_answers_error() {
        let router = Router::new();
        router.register_action_handler("heartbeat", Arc::new(Echo));
        let response = router
            .dispatch_request(Request::new("heartbeat", Some(json!({"nope": true}))), &ctx())
            .await;
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_one_shot_route_preferred_then_removed() {
        let router = Router::new();
        let broadcast = Arc::new(Counter::default());
        let once = Arc::new(Counter::default());
        router.register_response_handler("peer-list", broadcast.clone());
        router.register_response_handler("peer-list:abc", once.clone());

        let response = Response::success("PEER-LIST", "ok", Some(json!({"correlationId": "abc"})));
        assert!(router.dispatch_response(response.clone(), &ctx()).await);
        assert!(router.dispatch_response(response, &ctx()).await);

        assert_eq!(once.0.load(Ordering::SeqCst), 1);
        assert_eq!(broadcast.0.load(Ordering::SeqCst), 1);
        assert!(!router.remove_response_handler("peer-list:abc"));
    }

    #[tokio::test]
    async fn test_unrouted_response_dropped() {
        let router = Router::new();
        let handled = router
            .dispatch_response(Response::success("heartbeat", "ok", None), &ctx())
            .await;
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_oneshot_completes_once() {
        let (handler, rx) = OneShot::channel();
        let ctx = ctx();
        handler
            .on_response(Response::success("a", "first", None), &ctx)
            .await
            .unwrap();
        handler
            .on_response(Response::success("a", "second", None), &ctx)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().message, "first");
    }
}
