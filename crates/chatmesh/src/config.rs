//! Node configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! { "listen": "0.0.0.0:9000", "advertiseHost": "10.0.0.4", "seeds": ["10.0.0.5:9000"] }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chatmesh_core::PeerAddress;
use chatmesh_net::{ConnectConfig, HeartbeatConfig, MessengerConfig};
use chatmesh_sync::SyncConfig;

use crate::error::{NodeError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// Peer listener bind address.
    pub listen: String,
    /// Host announced to peers when `listen` binds a wildcard address.
    pub advertise_host: Option<String>,
    /// Client listener bind address; no client listener when absent.
    pub client_listen: Option<String>,
    pub node_name: Option<String>,
    /// Peers to join at startup.
    pub seeds: Vec<String>,
    /// SQLite database; in-memory storage when absent.
    pub database: Option<PathBuf>,

    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,

    pub sync_interval_ms: u64,
    pub min_cycle_interval_ms: u64,
    pub max_sync_retries: u32,
    pub lock_release_delay_ms: u64,

    pub call_timeout_ms: u64,
    pub checkout_timeout_ms: u64,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
            advertise_host: None,
            client_listen: None,
            node_name: None,
            seeds: Vec::new(),
            database: None,
            heartbeat_interval_ms: 30_000,
            sweep_interval_ms: 60_000,
            heartbeat_timeout_ms: 300_000,
            sync_interval_ms: 30_000,
            min_cycle_interval_ms: 2_000,
            max_sync_retries: 3,
            lock_release_delay_ms: 100,
            call_timeout_ms: 6_000,
            checkout_timeout_ms: 1_500,
            connect_retries: 3,
            connect_backoff_ms: 450,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))
    }

    pub fn seed_addresses(&self) -> Result<Vec<PeerAddress>> {
        self.seeds
            .iter()
            .map(|s| s.parse::<PeerAddress>().map_err(NodeError::from))
            .collect()
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            send_interval: Duration::from_millis(self.heartbeat_interval_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    pub fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            checkout_timeout: Duration::from_millis(self.checkout_timeout_ms),
            connect: ConnectConfig {
                retries: self.connect_retries,
                backoff: Duration::from_millis(self.connect_backoff_ms),
                ..ConnectConfig::default()
            },
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            min_cycle_interval: Duration::from_millis(self.min_cycle_interval_ms),
            max_retries: self.max_sync_retries,
            lock_release_delay: Duration::from_millis(self.lock_release_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_component_defaults() {
        let config = NodeConfig::default();
        let heartbeat = config.heartbeat_config();
        let expected = HeartbeatConfig::default();
        assert_eq!(heartbeat.send_interval, expected.send_interval);
        assert_eq!(heartbeat.sweep_interval, expected.sweep_interval);
        assert_eq!(heartbeat.timeout, expected.timeout);

        let messenger = config.messenger_config();
        assert_eq!(messenger.call_timeout, MessengerConfig::default().call_timeout);
        assert_eq!(messenger.connect.retries, 3);
        assert_eq!(messenger.connect.backoff, Duration::from_millis(450));

        let sync = config.sync_config();
        assert_eq!(sync.min_cycle_interval, SyncConfig::default().min_cycle_interval);
        assert_eq!(sync.max_retries, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"listen": "0.0.0.0:7000", "seeds": ["10.0.0.5:9000"], "maxSyncRetries": 5}"#).unwrap();

        let config = NodeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.listen, "0.0.0.0:7000");
        assert_eq!(config.max_sync_retries, 5);
        assert_eq!(config.call_timeout_ms, 6_000);
        assert_eq!(config.seed_addresses().unwrap(), vec![PeerAddress::new("10.0.0.5", 9000)]);
    }

    #[test]
    fn test_bad_seed_and_bad_file() {
        let config = NodeConfig {
            seeds: vec!["no-port".into()],
            ..NodeConfig::default()
        };
        assert!(matches!(config.seed_addresses(), Err(NodeError::Core(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NodeConfig::from_json_file(&path), Err(NodeError::Config(_))));
    }
}
