//! Heartbeat send and liveness sweep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::action::{Heartbeat, PeerRequest};
use crate::error::Result;
use crate::messenger::Messenger;
use crate::pool::PoolKind;
use crate::registry::PeerRegistry;
use crate::router::{ActionHandler, RequestContext};
use crate::wire::Response;

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub send_interval: Duration,
    pub sweep_interval: Duration,
    /// Silence after which an ONLINE peer becomes OFFLINE.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of one send tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<PeerRegistry>,
    messenger: Arc<Messenger>,
    config: HeartbeatConfig,
    send_enabled: AtomicBool,
    sweep_enabled: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<PeerRegistry>, messenger: Arc<Messenger>, config: HeartbeatConfig) -> Self {
        Self {
            registry,
            messenger,
            config,
            send_enabled: AtomicBool::new(true),
            sweep_enabled: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn set_send_enabled(&self, enabled: bool) {
        self.send_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_sweep_enabled(&self, enabled: bool) {
        self.sweep_enabled.store(enabled, Ordering::Release);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_sends(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Start the send and sweep tasks.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sender = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.send_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    this.send_tick().await;
                }
            })
        };
        let sweeper = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    this.sweep_tick();
                }
            })
        };
        vec![sender, sweeper]
    }

    async fn send_tick(&self) -> SendReport {
        if !self.send_enabled.load(Ordering::Acquire) {
            return SendReport::default();
        }
        self.send_all().await
    }

    fn sweep_tick(&self) -> usize {
        if !self.sweep_enabled.load(Ordering::Acquire) {
            return 0;
        }
        self.force_sweep()
    }

    /// Run one send round now, regardless of the enable flag.
    pub async fn force_send(&self) -> SendReport {
        self.send_all().await
    }

    /// Run one sweep now, regardless of the enable flag.
    pub fn force_sweep(&self) -> usize {
        let changed = self.registry.sweep_timeouts(self.config.timeout);
        if changed > 0 {
            debug!(changed, "sweep marked peers offline");
        }
        changed
    }

    async fn send_all(&self) -> SendReport {
        let beat = PeerRequest::Heartbeat(Heartbeat {
            peer_id: self.registry.local_id(),
            address: self.registry.local_address().clone(),
        });
        let request = match beat.to_request() {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "could not encode heartbeat");
                return SendReport::default();
            }
        };

        let mut report = SendReport::default();
        for peer in self.registry.list_active() {
            let outcome = async {
                self.messenger.ensure_session(&peer.address, PoolKind::Peers).await?;
                self.messenger.send_to(&peer.address, &request, PoolKind::Peers).await
            }
            .await;
            match outcome {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    trace!(peer = %peer.address, error = %e, "heartbeat not delivered");
                    report.failed += 1;
                }
            }
        }

        self.sent.fetch_add(report.sent as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }
}

/// Answers `heartbeat` by refreshing the sender.
pub struct HeartbeatHandler {
    registry: Arc<PeerRegistry>,
}

impl HeartbeatHandler {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ActionHandler for HeartbeatHandler {
    async fn handle(&self, request: PeerRequest, _ctx: &RequestContext) -> Result<Response> {
        let beat = match request {
            PeerRequest::Heartbeat(beat) => beat,
            other => return Ok(Response::error(other.action(), "expected heartbeat")),
        };
        self.registry
            .register_or_update(&beat.address, Some(beat.peer_id), None);
        Ok(Response::success(crate::action::actions::HEARTBEAT, "alive", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::MessengerConfig;
    use crate::pool::Pools;
    use crate::router::Router;
    use crate::session::Session;
    use crate::connector::ConnectConfig;
    use chatmesh_core::{PeerAddress, PeerId, PeerState};

    fn setup() -> (Arc<PeerRegistry>, Arc<Messenger>, Arc<HeartbeatMonitor>) {
        let registry = Arc::new(PeerRegistry::new(
            PeerId::from_bytes([1; 16]),
            PeerAddress::new("127.0.0.1", 9000),
        ));
        let config = MessengerConfig {
            checkout_timeout: Duration::from_millis(20),
            connect: ConnectConfig {
                retries: 1,
                backoff: Duration::from_millis(1),
                attempt_timeout: Duration::from_millis(100),
            },
            ..MessengerConfig::default()
        };
        let messenger = Arc::new(Messenger::new(Arc::new(Pools::new()), Arc::new(Router::new()), config));
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            messenger.clone(),
            HeartbeatConfig {
                timeout: Duration::from_millis(50),
                ..HeartbeatConfig::default()
            },
        ));
        (registry, messenger, monitor)
    }

    #[tokio::test]
    async fn test_send_reaches_online_peers_and_counts_failures() {
        let (registry, messenger, monitor) = setup();
        let reachable = PeerAddress::new("10.0.0.2", 7000);
        let (mine, theirs) = Session::pair(PeerAddress::new("127.0.0.1", 9000), reachable.clone());
        messenger.attach(Arc::new(mine), PoolKind::Peers);
        registry.register_or_update(&reachable, None, None);

        let dead_port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        registry.register_or_update(&PeerAddress::new("127.0.0.1", dead_port), None, None);

        let report = monitor.force_send().await;
        assert_eq!(report, SendReport { sent: 1, failed: 1 });
        assert_eq!(monitor.failed_sends(), 1);

        let line = theirs.read_line().await.unwrap().unwrap();
        assert!(line.contains("heartbeat"));
        assert!(line.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_disabled_tick_is_noop() {
        let (registry, _messenger, monitor) = setup();
        registry.register_or_update_at(&PeerAddress::new("10.0.0.2", 7000), None, None, 0);
        monitor.set_sweep_enabled(false);
        assert_eq!(monitor.sweep_tick(), 0);
        monitor.set_sweep_enabled(true);
        assert_eq!(monitor.sweep_tick(), 1);

        monitor.set_send_enabled(false);
        assert_eq!(monitor.send_tick().await, SendReport::default());
    }

    #[tokio::test]
    async fn test_handler_registers_sender() {
        let (registry, _messenger, _monitor) = setup();
        let handler = HeartbeatHandler::new(registry.clone());
        let (s, _far) = Session::pair(PeerAddress::new("a", 1), PeerAddress::new("10.0.0.7", 40000));
        let ctx = RequestContext::new(Arc::new(s), PoolKind::Peers);
        let id = PeerId::from_bytes([9; 16]);
        let response = handler
            .handle(
                PeerRequest::Heartbeat(Heartbeat {
                    peer_id: id,
                    address: PeerAddress::new("10.0.0.7", 9001),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(response.is_success());
        let peer = registry.get(&id).unwrap();
        assert_eq!(peer.state, PeerState::Online);
        assert_eq!(peer.address, PeerAddress::new("10.0.0.7", 9001));
    }
}
