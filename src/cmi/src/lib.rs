//! Cluster messaging interconnect between the two storage processors of an array.
//!
//! A [`CmiService`] negotiates the Active/Passive role with its peer, dispatches client
//! messages over a [`transport::Transport`], and forwards block and control operations to
//! the peer through the [`io::IoEngine`].
use std::time::Duration;

use thiserror::Error;

pub use tracing;
pub use tracing as log;

pub mod arbiter;
pub mod conduit;
pub mod config;
pub mod control;
pub mod io;
pub mod message;
pub mod registry;
pub mod role;
pub mod service;
pub mod stats;
pub mod transport;

pub use conduit::{ChannelDirectory, ClientId, ConduitId, Package, SpId};
pub use config::CmiConfig;
pub use role::Role;
pub use service::{CmiInfo, CmiService, ServiceState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid client: {0:?}")]
    InvalidClient(ClientId),
    #[error("Client {0:?} is already registered")]
    AlreadyRegistered(ClientId),
    #[error("Client {0:?} is not registered")]
    NotRegistered(ClientId),
    #[error("Peer not present")]
    PeerNotPresent,
    #[error("Contact with the peer was lost")]
    ContactLost,
    #[error("Traffic is disabled")]
    TrafficDisabled,
    #[error("Open handshake of {0:?} has not been established")]
    OpenNotEstablished(ClientId),
    #[error("Role did not settle within {0:?}")]
    RoleNotSettled(Duration),
    #[error("Timed out: {0}")]
    Timeout(&'static str),
    #[error("Payload of {len} bytes exceeds the limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Invalid conduit: {0}")]
    InvalidConduit(ConduitId),
    #[error("No free slot")]
    Busy,
    #[error("Service is not initialized")]
    NotInitialized,
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] transport::SendError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
