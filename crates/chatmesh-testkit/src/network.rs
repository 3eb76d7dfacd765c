//! In-process multi-node harness over loopback TCP.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use chatmesh::{Node, NodeConfig, Result};
use chatmesh_core::{Entity, EntityKind};
use chatmesh_store::{EntityStore, MemoryStore};

/// Config with short timers and the automatic scheduler effectively off,
/// bound to an ephemeral loopback port.
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        listen: "127.0.0.1:0".to_string(),
        heartbeat_interval_ms: 200,
        sweep_interval_ms: 200,
        heartbeat_timeout_ms: 1_000,
        sync_interval_ms: 3_600_000,
        min_cycle_interval_ms: 20,
        lock_release_delay_ms: 20,
        call_timeout_ms: 2_000,
        checkout_timeout_ms: 200,
        connect_retries: 2,
        connect_backoff_ms: 20,
        ..NodeConfig::default()
    }
}

/// One node of a [`TestNetwork`] with direct access to its store.
pub struct TestNode {
    pub node: Arc<Node>,
    pub store: Arc<MemoryStore>,
}

impl TestNode {
    pub async fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.store.list_all_for_sync(kind).await.unwrap_or_default()
    }
}

/// A set of nodes running in this process.
pub struct TestNetwork {
    nodes: Vec<TestNode>,
}

impl TestNetwork {
    /// Start one node per dataset. Nodes are not joined.
    pub async fn start(datasets: Vec<Vec<Entity>>) -> Result<Self> {
        let mut nodes = Vec::with_capacity(datasets.len());
        for data in datasets {
            let store = Arc::new(MemoryStore::with_entities(data));
            let node = Node::start(fast_config(), store.clone()).await?;
            nodes.push(TestNode { node, store });
        }
        Ok(Self { nodes })
    }

    /// Start `count` empty nodes.
    pub async fn empty(count: usize) -> Result<Self> {
        Self::start(vec![Vec::new(); count]).await
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node after the first joins the first.
    pub async fn join_all(&self) -> Result<()> {
        let Some((first, rest)) = self.nodes.split_first() else {
            return Ok(());
        };
        for member in rest {
            member.node.join(first.node.local_address()).await?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for member in &self.nodes {
            member.node.shutdown();
        }
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}
