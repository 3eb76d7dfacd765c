//! Peer model: addresses, liveness states, and peer records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::PeerId;

/// Network address of a peer's listening socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidAddress(format!("missing port in {s:?}")))?;
        if host.is_empty() {
            return Err(CoreError::InvalidAddress(format!("missing host in {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| CoreError::InvalidAddress(format!("bad port in {s:?}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Liveness state of a peer as seen by the local registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    Online,
    Offline,
    Unknown,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Online => "ONLINE",
            PeerState::Offline => "OFFLINE",
            PeerState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(PeerState::Online),
            "OFFLINE" => Some(PeerState::Offline),
            "UNKNOWN" => Some(PeerState::Unknown),
            _ => None,
        }
    }
}

/// A known node of the replication network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub address: PeerAddress,
    pub state: PeerState,
    /// Unix milliseconds of the last heartbeat or response heard from this peer.
    pub last_heartbeat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Peer {
    /// A peer freshly heard from at `now`.
    pub fn online(id: PeerId, address: PeerAddress, now: i64) -> Self {
        Self {
            id,
            address,
            state: PeerState::Online,
            last_heartbeat: now,
            name: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == PeerState::Online
    }
}
