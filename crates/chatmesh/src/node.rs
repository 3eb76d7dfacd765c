//! The node: composition root for every chatmesh component.
//!
//! `Node::start` binds the listeners, wires registry, router, messenger,
//! discovery, heartbeat and sync engine together, starts their background
//! tasks and joins the configured seeds.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatmesh_core::{Entity, File, Peer, PeerAddress, PeerId};
use chatmesh_net::{
    actions, Discovery, HeartbeatHandler, HeartbeatMonitor, Messenger, PeerRegistry, PoolKind,
    Pools, PushPublisher, Router, Session,
};
use chatmesh_store::{EntityStore, FileStore, PeerStore};
use chatmesh_sync::{verify_payload, SyncEngine};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Backoff after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A running chatmesh node.
pub struct Node {
    config: NodeConfig,
    entities: Arc<dyn EntityStore>,
    files: Arc<dyn FileStore>,
    registry: Arc<PeerRegistry>,
    router: Arc<Router>,
    messenger: Arc<Messenger>,
    discovery: Arc<Discovery>,
    heartbeat: Arc<HeartbeatMonitor>,
    engine: Arc<SyncEngine>,
    client_address: Option<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind, wire and start a node over `store`.
    pub async fn start<S>(config: NodeConfig, store: Arc<S>) -> Result<Arc<Self>>
    where
        S: EntityStore + FileStore + PeerStore + 'static,
    {
        let seeds = config.seed_addresses()?;

        let listener = TcpListener::bind(&config.listen).await?;
        let local = advertised_address(&config, listener.local_addr()?)?;
        let client_listener = match &config.client_listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let client_address = client_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        // Registry
        let registry = Arc::new(PeerRegistry::new(PeerId::random(), local.clone()).with_store(store.clone()));
        let restored = registry.load_from(store.as_ref()).await?;

        // Messaging
        let router = Arc::new(Router::new());
        let messenger = Arc::new(Messenger::new(
            Arc::new(Pools::new()),
            router.clone(),
            config.messenger_config(),
        ));
        messenger.set_activity_sink(registry.clone());

        // Discovery and liveness
        let mut discovery = Discovery::new(registry.clone(), messenger.clone());
        if let Some(name) = &config.node_name {
            discovery = discovery.with_name(name.clone());
        }
        let discovery = Arc::new(discovery);
        discovery.register_handlers(&router);
        registry.add_observer(Arc::new(PushPublisher::new(&registry, messenger.clone())));
        router.register_action_handler(actions::HEARTBEAT, Arc::new(HeartbeatHandler::new(registry.clone())));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            messenger.clone(),
            config.heartbeat_config(),
        ));

        // Replication
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            registry.clone(),
            messenger.clone(),
            config.sync_config(),
        ));
        engine.register_handlers(&router);
        registry.add_observer(engine.peer_trigger());

        let mut tasks = vec![
            spawn_accept_loop(listener, messenger.clone(), PoolKind::Peers),
            messenger.spawn_reader(PoolKind::Peers),
            engine.spawn_scheduler(),
        ];
        if let Some(listener) = client_listener {
            tasks.push(spawn_accept_loop(listener, messenger.clone(), PoolKind::Clients));
            tasks.push(messenger.spawn_reader(PoolKind::Clients));
        }
        tasks.extend(heartbeat.spawn());

        info!(
            id = %registry.local_id(),
            address = %local,
            clients = ?client_address,
            restored,
            "node started"
        );

        let node = Arc::new(Self {
            entities: store.clone(),
            files: store,
            config,
            registry,
            router,
            messenger,
            discovery,
            heartbeat,
            engine,
            client_address,
            tasks: Mutex::new(tasks),
        });

        for seed in seeds {
            if let Err(e) = node.join(&seed).await {
                warn!(%seed, error = %e, "could not join seed");
            }
        }
        node.rejoin_known_peers();
        Ok(node)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_id(&self) -> PeerId {
        self.registry.local_id()
    }

    /// The address announced to peers.
    pub fn local_address(&self) -> &PeerAddress {
        self.registry.local_address()
    }

    pub fn client_address(&self) -> Option<SocketAddr> {
        self.client_address
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Join `seed` and merge its peer list.
    pub async fn join(&self, seed: &PeerAddress) -> Result<Vec<Peer>> {
        Ok(self.discovery.bootstrap(seed).await?)
    }

    /// Rejoin peers restored from storage that are not known to be online.
    fn rejoin_known_peers(&self) {
        for peer in self.registry.list_all() {
            if peer.is_online() {
                continue;
            }
            let discovery = self.discovery.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery.join(&peer.address).await {
                    debug!(peer = %peer.address, error = %e, "known peer unreachable");
                }
            });
        }
    }

    /// Save a locally created or edited entity and schedule replication.
    pub async fn save_entity(&self, entity: &Entity) -> Result<bool> {
        let changed = self.entities.save(entity).await?;
        if changed {
            self.engine.notify_local_change();
        }
        Ok(changed)
    }

    /// Store an uploaded file: payload first, then its metadata.
    pub async fn save_file(&self, file: File, payload: Bytes) -> Result<bool> {
        verify_payload(&file, &payload)?;
        self.files.store_payload(&file.id, payload).await?;
        self.save_entity(&Entity::File(file)).await
    }

    /// Stop background tasks and close every session.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        self.engine.set_scheduler_enabled(false);
        self.messenger.shutdown();
        debug!(address = %self.local_address(), tasks = tasks.len(), "node stopped");
    }
}

fn advertised_address(config: &NodeConfig, bound: SocketAddr) -> Result<PeerAddress> {
    match &config.advertise_host {
        Some(host) => Ok(PeerAddress::new(host.clone(), bound.port())),
        None if bound.ip().is_unspecified() => Err(NodeError::Config(format!(
            "listen address {bound} is a wildcard; set advertiseHost"
        ))),
        None => Ok(PeerAddress::from(bound)),
    }
}

fn spawn_accept_loop(listener: TcpListener, messenger: Arc<Messenger>, pool: PoolKind) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(%pool, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            match Session::accepted(stream) {
                Ok(session) => {
                    debug!(%pool, peer = %session.remote(), "accepted connection");
                    messenger.attach(Arc::new(session), pool);
                }
                Err(e) => warn!(%pool, error = %e, "dropping accepted connection"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_needs_advertise_host() {
        let bound: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        assert!(matches!(
            advertised_address(&NodeConfig::default(), bound),
            Err(NodeError::Config(_))
        ));

        let config = NodeConfig {
            advertise_host: Some("10.0.0.4".into()),
            ..NodeConfig::default()
        };
        assert_eq!(
            advertised_address(&config, bound).unwrap(),
            PeerAddress::new("10.0.0.4", 9000)
        );

        let loopback: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        assert_eq!(
            advertised_address(&NodeConfig::default(), loopback).unwrap(),
            PeerAddress::new("127.0.0.1", 9100)
        );
    }
}
