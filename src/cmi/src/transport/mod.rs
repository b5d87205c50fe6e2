//! Contract with the byte-moving transport between the two nodes.
//!
//! The transport frames and delivers opaque payloads per `(conduit, client)`, detects
//! peer liveness, and reports every accepted send back exactly once through an
//! [`EventSink`] together with the caller's [`MessageContext`].
use std::any::Any;
use std::fmt;
use std::sync::Weak;

use thiserror::Error;

use crate::conduit::{ClientId, ConduitId};

pub mod loopback;

pub use loopback::LoopbackTransport;

/// Caller-owned context of one send, handed back with its terminal event.
pub type MessageContext = Box<dyn Any + Send>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("No device: peer not reachable")]
    NoDevice,
    #[error("Generic failure: {0}")]
    GenericFailure(String),
}

/// A send the transport refused synchronously. The context is returned untouched.
pub struct SendFailure {
    pub error: SendError,
    pub context: Option<MessageContext>,
}

impl fmt::Debug for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendFailure")
            .field("error", &self.error)
            .field("context", &self.context.is_some())
            .finish()
    }
}

pub enum TransportEvent {
    Transmitted {
        conduit: ConduitId,
        client: ClientId,
        context: Option<MessageContext>,
    },
    Received {
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
    },
    ContactLost,
    /// The peer got the message but could not process it.
    FatalError {
        conduit: ConduitId,
        client: ClientId,
        context: Option<MessageContext>,
    },
    PeerBusy {
        conduit: ConduitId,
        client: ClientId,
        context: Option<MessageContext>,
    },
    PeerNotPresent {
        conduit: ConduitId,
        client: ClientId,
        context: Option<MessageContext>,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Transmitted { conduit, client, .. } => {
                write!(f, "Transmitted({}, {:?})", conduit, client)
            }
            TransportEvent::Received {
                conduit,
                client,
                payload,
            } => write!(f, "Received({}, {:?}, {} bytes)", conduit, client, payload.len()),
            TransportEvent::ContactLost => f.write_str("ContactLost"),
            TransportEvent::FatalError { conduit, client, .. } => {
                write!(f, "FatalError({}, {:?})", conduit, client)
            }
            TransportEvent::PeerBusy { conduit, client, .. } => {
                write!(f, "PeerBusy({}, {:?})", conduit, client)
            }
            TransportEvent::PeerNotPresent { conduit, client, .. } => {
                write!(f, "PeerNotPresent({}, {:?})", conduit, client)
            }
        }
    }
}

/// Receiver of asynchronous transport events. Implemented by the service.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: TransportEvent);
}

pub trait Transport: Send + Sync {
    /// Makes `conduit` usable for sends from this node.
    fn open_conduit(&self, _conduit: ConduitId) -> Result<(), SendError> {
        Ok(())
    }

    /// Queues `payload` for the peer. On `Ok` exactly one terminal event
    /// (`Transmitted`, `PeerBusy`, `PeerNotPresent` or `FatalError`) follows later.
    fn send(
        &self,
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
    ) -> Result<(), SendFailure>;

    fn attach(&self, sink: Weak<dyn EventSink>);

    fn detach(&self);
}
