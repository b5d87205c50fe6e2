use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpTransportConfig {
    /// Address to accept the peer on.
    pub listen: Option<SocketAddr>,
    /// Address of a listening peer to connect to.
    pub peer: Option<SocketAddr>,
    pub connect_retry_ms: u64,
    pub poll_timeout_ms: u64,
    pub heartbeat_ms: u64,
    /// Silence after which the peer is declared lost.
    pub peer_timeout_ms: u64,
    pub max_frame_len: u64,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            listen: None,
            peer: None,
            connect_retry_ms: 500,
            poll_timeout_ms: 50,
            heartbeat_ms: 500,
            peer_timeout_ms: 3_000,
            max_frame_len: 4 << 20,
        }
    }
}

impl TcpTransportConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config: TcpTransportConfig = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), crate::TransportError> {
        if self.listen.is_some() == self.peer.is_some() {
            return Err(crate::TransportError::Config(
                "exactly one of `listen` and `peer` must be set".into(),
            ));
        }
        if self.heartbeat_ms == 0 || self.peer_timeout_ms <= self.heartbeat_ms {
            return Err(crate::TransportError::Config(format!(
                "peer_timeout_ms ({}) must exceed a non-zero heartbeat_ms ({})",
                self.peer_timeout_ms, self.heartbeat_ms
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    #[inline]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    #[inline]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    #[inline]
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}
