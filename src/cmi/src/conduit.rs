//! Channel directory: which conduit carries which client, and which conduits a node opens.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CmiConfig;
use crate::role::Role;

/// Identity of a storage processor. `A` orders before `B` and wins every tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SpId {
    A,
    B,
}

impl SpId {
    #[inline]
    pub fn peer(self) -> SpId {
        match self {
            SpId::A => SpId::B,
            SpId::B => SpId::A,
        }
    }

    #[inline]
    pub fn wins_tie_break(self) -> bool {
        self < self.peer()
    }
}

impl Default for SpId {
    fn default() -> Self {
        SpId::A
    }
}

impl fmt::Display for SpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpId::A => f.write_str("SPA"),
            SpId::B => f.write_str("SPB"),
        }
    }
}

/// The software package a node runs. It decides which clients live on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Package {
    Physical,
    Sep,
    Neit,
}

impl Default for Package {
    fn default() -> Self {
        Package::Sep
    }
}

/// A logical, independently ordered message path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConduitId {
    Service,
    Database,
    Metadata,
    Job,
    Persist,
    /// Bulk I/O, one per CPU core.
    SepIo(u16),
}

impl fmt::Display for ConduitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConduitId::SepIo(n) => write!(f, "SepIo{}", n),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A logical subsystem that exchanges messages with its counterpart on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClientId {
    /// Role negotiation, open handshake and panic arbitration.
    Service,
    Database,
    Metadata,
    Job,
    Persist,
    /// The I/O forwarding engine.
    SepIo,
    User(u16),
}

impl ClientId {
    /// Whether the client must complete the open handshake before it may send.
    pub fn requires_open(self) -> bool {
        matches!(self, ClientId::Database | ClientId::Metadata | ClientId::Persist)
    }

    fn package(self) -> Option<Package> {
        match self {
            ClientId::Database | ClientId::Persist => None,
            ClientId::Metadata | ClientId::Job | ClientId::SepIo => Some(Package::Sep),
            ClientId::Service | ClientId::User(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelDirectory {
    package: Package,
    io_conduits: u16,
    max_user_clients: u16,
}

impl ChannelDirectory {
    pub fn new(config: &CmiConfig) -> Self {
        ChannelDirectory {
            package: config.package,
            io_conduits: config.io_conduits.max(1),
            max_user_clients: config.max_user_clients,
        }
    }

    #[inline]
    pub fn package(&self) -> Package {
        self.package
    }

    pub fn is_valid_client(&self, client: ClientId) -> bool {
        match client {
            ClientId::User(n) => n < self.max_user_clients,
            _ => true,
        }
    }

    /// Default conduit of a client. The forwarding engine picks a per-cpu conduit itself.
    pub fn conduit_for(&self, client: ClientId) -> ConduitId {
        match client {
            ClientId::Service | ClientId::User(_) => ConduitId::Service,
            ClientId::Database => ConduitId::Database,
            ClientId::Metadata => ConduitId::Metadata,
            ClientId::Job => ConduitId::Job,
            ClientId::Persist => ConduitId::Persist,
            ClientId::SepIo => ConduitId::SepIo(0),
        }
    }

    #[inline]
    pub fn io_conduit(&self, cpu_id: u32) -> ConduitId {
        ConduitId::SepIo((cpu_id % self.io_conduits as u32) as u16)
    }

    #[inline]
    pub fn io_conduit_count(&self) -> u16 {
        self.io_conduits
    }

    pub fn is_io_conduit(&self, conduit: ConduitId) -> bool {
        matches!(conduit, ConduitId::SepIo(n) if n < self.io_conduits)
    }

    pub fn io_conduits(&self) -> impl Iterator<Item = ConduitId> {
        (0..self.io_conduits).map(ConduitId::SepIo)
    }

    fn owns(&self, client: ClientId) -> bool {
        match (self.package, client) {
            (_, ClientId::Service) | (_, ClientId::User(_)) => true,
            (Package::Neit, _) => false,
            (Package::Physical, ClientId::Database | ClientId::Persist) => true,
            (Package::Physical, _) => false,
            (Package::Sep, c) => c.package().map_or(true, |p| p == Package::Sep),
        }
    }

    /// Conduits this node opens once it holds `role`.
    pub fn conduits_to_open(&self, role: Role) -> Vec<ConduitId> {
        let mut conduits = vec![ConduitId::Service];
        if role == Role::ServiceMode {
            return conduits;
        }
        for client in [
            ClientId::Database,
            ClientId::Metadata,
            ClientId::Job,
            ClientId::Persist,
        ] {
            if self.owns(client) {
                conduits.push(self.conduit_for(client));
            }
        }
        if self.owns(ClientId::SepIo) {
            conduits.extend(self.io_conduits());
        }
        conduits
    }
}
