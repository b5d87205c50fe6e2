use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conduit::{Package, SpId};
use crate::Error;

/// Geometry of the staging pools. Both nodes must agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub large_slot_len: usize,
    pub large_slots: u32,
    pub small_slot_len: usize,
    pub small_slots: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            large_slot_len: 256 * 1024,
            large_slots: 64,
            small_slot_len: 8 * 1024,
            small_slots: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NegotiationConfig {
    /// Budget for the role to leave `Busy` at startup.
    pub settle_timeout_ms: u64,
    /// Handshake resend period while still `Busy`.
    pub handshake_retry_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            settle_timeout_ms: 30_000,
            handshake_retry_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CmiConfig {
    pub sp: SpId,
    pub package: Package,
    pub io_conduits: u16,
    pub max_user_clients: u16,
    pub pools: PoolConfig,
    pub negotiation: NegotiationConfig,
    pub open_retry_ms: u64,
    pub drain_timeout_ms: u64,
    /// Scatter lists with at least this many fragments are copied through the slot.
    pub max_sg_fragments: usize,
}

impl Default for CmiConfig {
    fn default() -> Self {
        CmiConfig {
            sp: SpId::A,
            package: Package::Sep,
            io_conduits: 4,
            max_user_clients: 16,
            pools: PoolConfig::default(),
            negotiation: NegotiationConfig::default(),
            open_retry_ms: 3_000,
            drain_timeout_ms: 10_000,
            max_sg_fragments: 16,
        }
    }
}

impl CmiConfig {
    pub fn new(config: Option<&str>) -> Result<Self, Error> {
        let config: CmiConfig = toml::from_str(config.unwrap_or(""))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::new(Some(&content))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let pools = &self.pools;
        if pools.large_slots == 0 || pools.small_slots == 0 {
            return Err(Error::InvalidConfig("every pool needs at least one slot".into()));
        }
        if pools.small_slot_len == 0 || pools.small_slot_len > pools.large_slot_len {
            return Err(Error::InvalidConfig(format!(
                "small slots ({}) must be non-empty and no larger than large slots ({})",
                pools.small_slot_len, pools.large_slot_len
            )));
        }
        if pools.large_slot_len > u32::MAX as usize {
            return Err(Error::InvalidConfig("large slot length exceeds u32".into()));
        }
        if self.io_conduits == 0 {
            return Err(Error::InvalidConfig("at least one io conduit is required".into()));
        }
        if self.max_sg_fragments == 0 {
            return Err(Error::InvalidConfig("max_sg_fragments must be positive".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation.settle_timeout_ms)
    }

    #[inline]
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.negotiation.handshake_retry_ms.max(1))
    }

    #[inline]
    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms.max(1))
    }

    #[inline]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
