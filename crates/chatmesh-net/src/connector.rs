//! Outbound connection establishment with bounded retries.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use chatmesh_core::PeerAddress;

use crate::error::{NetError, Result};
use crate::session::Session;

/// Retry policy for fallback connects.
#[derive(Clone, Debug)]
pub struct ConnectConfig {
    /// Total attempts before giving up.
    pub retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
    /// Per-attempt connect deadline.
    pub attempt_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(450),
            attempt_timeout: Duration::from_secs(3),
        }
    }
}

/// Opens TCP sessions to peer listening addresses.
#[derive(Clone, Debug, Default)]
pub struct Connector {
    config: ConnectConfig,
}

impl Connector {
    pub fn new(config: ConnectConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Connect to `address`, retrying with linear backoff.
    pub async fn connect(&self, address: &PeerAddress) -> Result<Session> {
        let attempts = self.config.retries.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            let dial = TcpStream::connect((address.host.as_str(), address.port));
            match tokio::time::timeout(self.config.attempt_timeout, dial).await {
                Ok(Ok(stream)) => {
                    debug!(peer = %address, attempt, "connected");
                    return Ok(Session::from_tcp(stream, address.clone()));
                }
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => reason = "connect timed out".to_string(),
            }
            if attempt < attempts {
                let delay = self.config.backoff * attempt;
                debug!(peer = %address, attempt, ?delay, %reason, "connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        warn!(peer = %address, attempts, %reason, "giving up on connect");
        Err(NetError::ConnectFailed {
            address: address.clone(),
            attempts,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = Connector::default();
        let target = PeerAddress::new("127.0.0.1", port);
        let session = connector.connect(&target).await.unwrap();
        assert!(session.matches(&target));
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let connector = Connector::new(ConnectConfig {
            retries: 2,
            backoff: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(200),
        });
        let err = connector
            .connect(&PeerAddress::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { attempts: 2, .. }));
    }
}
