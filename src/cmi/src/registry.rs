//! Registered clients, their callbacks and their open handshake with the peer.
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

use crate::conduit::{ChannelDirectory, ClientId, ConduitId};
use crate::message::{self, Handshake, ServiceMessage, ServiceToken};
use crate::role::{HandshakeSender, NodeStatus, Role};
use crate::transport::{MessageContext, SendError, SendFailure, Transport, TransportEvent};
use crate::Error;

bitflags! {
    /// Session state of a client with its counterpart on the peer.
    #[derive(Default)]
    pub struct OpenState: u32 {
        const OPEN_NOT_NEEDED = 0b0_0001;
        const OPEN_REQUIRED = 0b0_0010;
        const LOCAL_READY = 0b0_0100;
        const OPEN_RECEIVED = 0b0_1000;
        const OPEN_ESTABLISHED = 0b1_0000;
    }
}

/// Opaque context given at registration, handed back with asynchronous events.
pub type RegistrationContext = Arc<dyn Any + Send + Sync>;

pub enum ClientEvent<'a> {
    Transmitted {
        conduit: ConduitId,
        context: Option<MessageContext>,
    },
    Received {
        conduit: ConduitId,
        message: &'a [u8],
        context: &'a RegistrationContext,
    },
    ContactLost {
        context: &'a RegistrationContext,
    },
    PeerNotPresent {
        conduit: ConduitId,
        context: Option<MessageContext>,
    },
    PeerBusy {
        conduit: ConduitId,
        context: Option<MessageContext>,
    },
    FatalError {
        conduit: ConduitId,
        context: Option<MessageContext>,
    },
}

impl<'a> fmt::Debug for ClientEvent<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Transmitted { conduit, .. } => write!(f, "Transmitted({})", conduit),
            ClientEvent::Received {
                conduit, message, ..
            } => write!(f, "Received({}, {} bytes)", conduit, message.len()),
            ClientEvent::ContactLost { .. } => f.write_str("ContactLost"),
            ClientEvent::PeerNotPresent { conduit, .. } => write!(f, "PeerNotPresent({})", conduit),
            ClientEvent::PeerBusy { conduit, .. } => write!(f, "PeerBusy({})", conduit),
            ClientEvent::FatalError { conduit, .. } => write!(f, "FatalError({})", conduit),
        }
    }
}

pub trait ClientCallback: Send + Sync {
    fn on_event(&self, client: ClientId, event: ClientEvent<'_>);
}

struct Registration {
    callback: Arc<dyn ClientCallback>,
    context: RegistrationContext,
    open: OpenState,
}

#[derive(Debug, Default)]
struct Counters {
    outstanding: u64,
    received: u64,
}

impl Counters {
    #[inline]
    fn idle(&self) -> bool {
        self.outstanding == 0 && self.received == 0
    }
}

#[derive(Debug, Default)]
struct OpenMonitor {
    generation: u64,
    contact_epoch: u64,
}

pub struct ClientRegistry {
    directory: ChannelDirectory,
    transport: Arc<dyn Transport>,
    status: Arc<NodeStatus>,
    clients: DashMap<ClientId, Registration, FnvBuildHasher>,
    traffic_enabled: AtomicBool,
    counters: Mutex<Counters>,
    quiesced: Condvar,
    open: Mutex<OpenMonitor>,
    open_changed: Condvar,
    open_retry: Duration,
}

impl ClientRegistry {
    pub fn new(
        directory: ChannelDirectory,
        transport: Arc<dyn Transport>,
        status: Arc<NodeStatus>,
        open_retry: Duration,
    ) -> Self {
        ClientRegistry {
            directory,
            transport,
            status,
            clients: DashMap::default(),
            traffic_enabled: AtomicBool::new(true),
            counters: Mutex::new(Counters::default()),
            quiesced: Condvar::new(),
            open: Mutex::new(OpenMonitor::default()),
            open_changed: Condvar::new(),
            open_retry,
        }
    }

    #[inline]
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn register(
        &self,
        client: ClientId,
        callback: Arc<dyn ClientCallback>,
        context: RegistrationContext,
    ) -> Result<(), Error> {
        self.register_with(client, callback, context, client.requires_open())
    }

    /// Registers `client`, choosing whether it must complete the open handshake.
    pub fn register_with(
        &self,
        client: ClientId,
        callback: Arc<dyn ClientCallback>,
        context: RegistrationContext,
        open_required: bool,
    ) -> Result<(), Error> {
        if !self.directory.is_valid_client(client) {
            return Err(Error::InvalidClient(client));
        }
        match self.clients.entry(client) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(client)),
            Entry::Vacant(slot) => {
                let open = if open_required {
                    OpenState::OPEN_REQUIRED
                } else {
                    OpenState::OPEN_NOT_NEEDED
                };
                slot.insert(Registration {
                    callback,
                    context,
                    open,
                });
                tracing::debug!("client {:?} registered, {:?}", client, open);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, client: ClientId) -> Result<(), Error> {
        self.clients
            .remove(&client)
            .ok_or(Error::NotRegistered(client))?;
        self.open_changed();
        tracing::debug!("client {:?} unregistered", client);
        Ok(())
    }

    #[inline]
    pub fn is_registered(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn open_state(&self, client: ClientId) -> Option<OpenState> {
        self.clients.get(&client).map(|reg| reg.open)
    }

    #[inline]
    pub fn traffic_enabled(&self) -> bool {
        self.traffic_enabled.load(Ordering::Acquire)
    }

    pub fn enable_traffic(&self) {
        self.traffic_enabled.store(true, Ordering::Release);
        tracing::info!("traffic enabled");
    }

    /// Stops new sends and waits for in-flight and in-dispatch messages to drain.
    pub fn disable_traffic(&self, timeout: Duration) -> Result<(), Error> {
        self.traffic_enabled.store(false, Ordering::Release);
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let (counters, _) = self
            .quiesced
            .wait_timeout_while(counters, timeout, |c| !c.idle())
            .unwrap_or_else(PoisonError::into_inner);
        if !counters.idle() {
            tracing::warn!(
                "traffic disabled with {} outstanding and {} received messages pending",
                counters.outstanding,
                counters.received
            );
            return Err(Error::Timeout("draining messages"));
        }
        tracing::info!("traffic disabled");
        Ok(())
    }

    pub fn outstanding_messages(&self) -> u64 {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).outstanding
    }

    pub fn received_messages(&self) -> u64 {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).received
    }

    fn begin_message(&self) {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).outstanding += 1;
    }

    fn end_message(&self) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.outstanding = counters.outstanding.saturating_sub(1);
        if counters.idle() {
            self.quiesced.notify_all();
        }
    }

    fn begin_receive(&self) {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).received += 1;
    }

    fn end_receive(&self) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.received = counters.received.saturating_sub(1);
        if counters.idle() {
            self.quiesced.notify_all();
        }
    }

    fn callback(&self, client: ClientId) -> Option<(Arc<dyn ClientCallback>, RegistrationContext)> {
        self.clients
            .get(&client)
            .map(|reg| (Arc::clone(&reg.callback), Arc::clone(&reg.context)))
    }

    /// Sends `payload` to `client`'s counterpart on `conduit`.
    ///
    /// On any failure the client's callback has already received the terminal event
    /// together with `context` by the time this returns.
    pub fn send(
        &self,
        client: ClientId,
        conduit: ConduitId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
    ) -> Result<(), Error> {
        let (callback, open) = match self.clients.get(&client) {
            Some(reg) => (Arc::clone(&reg.callback), reg.open),
            None => return Err(Error::NotRegistered(client)),
        };

        if client != ClientId::Service {
            let refused = if !self.status.peer_alive() {
                Some(Error::PeerNotPresent)
            } else if !self.traffic_enabled() {
                Some(Error::TrafficDisabled)
            } else if open.contains(OpenState::OPEN_REQUIRED)
                && !open.contains(OpenState::OPEN_ESTABLISHED)
            {
                Some(Error::OpenNotEstablished(client))
            } else {
                None
            };
            if let Some(err) = refused {
                tracing::debug!("send of {:?} on {} refused: {}", client, conduit, err);
                callback.on_event(client, ClientEvent::PeerNotPresent { conduit, context });
                return Err(err);
            }
        }

        self.begin_message();
        match self.transport.send(conduit, client, payload, context) {
            Ok(()) => Ok(()),
            Err(SendFailure { error, context }) => {
                self.end_message();
                tracing::debug!("transport refused {:?} on {}: {}", client, conduit, error);
                let event = match error {
                    SendError::NoDevice => ClientEvent::PeerNotPresent { conduit, context },
                    SendError::GenericFailure(_) => ClientEvent::FatalError { conduit, context },
                };
                callback.on_event(client, event);
                Err(Error::Transport(error))
            }
        }
    }

    pub(crate) fn send_service(
        &self,
        msg: &ServiceMessage,
        token: ServiceToken,
    ) -> Result<(), Error> {
        let payload = message::encode(msg)?;
        self.send(
            ClientId::Service,
            ConduitId::Service,
            payload,
            Some(Box::new(token)),
        )
    }

    /// Routes one transport event to the addressed client.
    pub fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::Received {
                conduit,
                client,
                payload,
            } => self.deliver_received(client, conduit, &payload),
            TransportEvent::Transmitted {
                conduit,
                client,
                context,
            } => {
                self.end_message();
                self.deliver(client, ClientEvent::Transmitted { conduit, context });
            }
            TransportEvent::PeerBusy {
                conduit,
                client,
                context,
            } => {
                self.end_message();
                self.deliver(client, ClientEvent::PeerBusy { conduit, context });
            }
            TransportEvent::PeerNotPresent {
                conduit,
                client,
                context,
            } => {
                self.end_message();
                self.deliver(client, ClientEvent::PeerNotPresent { conduit, context });
            }
            TransportEvent::FatalError {
                conduit,
                client,
                context,
            } => {
                self.end_message();
                self.deliver(client, ClientEvent::FatalError { conduit, context });
            }
            TransportEvent::ContactLost => self.on_contact_lost(),
        }
    }

    /// Hands a terminal send event to `client`.
    pub(crate) fn deliver(&self, client: ClientId, event: ClientEvent<'_>) {
        match self.callback(client) {
            Some((callback, _)) => callback.on_event(client, event),
            None => tracing::warn!("{:?} for unregistered client {:?} dropped", event, client),
        }
    }

    /// Hands an inbound message to `client` with its registration context.
    pub(crate) fn deliver_received(&self, client: ClientId, conduit: ConduitId, message: &[u8]) {
        let (callback, context) = match self.callback(client) {
            Some(target) => target,
            None => {
                tracing::warn!(
                    "message of {} bytes for unregistered client {:?} dropped",
                    message.len(),
                    client
                );
                return;
            }
        };
        self.begin_receive();
        callback.on_event(
            client,
            ClientEvent::Received {
                conduit,
                message,
                context: &context,
            },
        );
        self.end_receive();
    }

    /// Clears every open session, releases open waiters and tells every client.
    pub fn on_contact_lost(&self) {
        let mut targets = Vec::with_capacity(self.clients.len());
        for mut reg in self.clients.iter_mut() {
            let client = *reg.key();
            reg.open
                .remove(OpenState::OPEN_RECEIVED | OpenState::OPEN_ESTABLISHED);
            if client != ClientId::Service {
                targets.push((client, Arc::clone(&reg.callback), Arc::clone(&reg.context)));
            }
        }
        {
            let mut monitor = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            monitor.generation += 1;
            monitor.contact_epoch += 1;
        }
        self.open_changed.notify_all();
        for (client, callback, context) in targets {
            callback.on_event(client, ClientEvent::ContactLost { context: &context });
        }
    }

    fn open_changed(&self) {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).generation += 1;
        self.open_changed.notify_all();
    }

    fn update_open<R>(&self, client: ClientId, f: impl FnOnce(&mut OpenState) -> R) -> Option<R> {
        let ret = self.clients.get_mut(&client).map(|mut reg| f(&mut reg.open));
        if ret.is_some() {
            self.open_changed();
        }
        ret
    }

    fn send_open_ack(&self, client: ClientId) {
        if let Err(e) = self.send_service(&ServiceMessage::OpenAck { client }, ServiceToken::Open(client)) {
            tracing::warn!("open ack of {:?} not sent: {}", client, e);
        }
    }

    /// The local client is ready to talk to its counterpart.
    pub fn mark_ready(&self, client: ClientId) -> Result<(), Error> {
        let established = self
            .update_open(client, |open| {
                open.insert(OpenState::LOCAL_READY);
                if open.contains(OpenState::OPEN_RECEIVED)
                    && !open.contains(OpenState::OPEN_ESTABLISHED)
                {
                    open.insert(OpenState::OPEN_ESTABLISHED);
                    true
                } else {
                    false
                }
            })
            .ok_or(Error::NotRegistered(client))?;
        if established {
            self.send_open_ack(client);
        }
        Ok(())
    }

    pub(crate) fn on_open_request(&self, client: ClientId) {
        let ready = self.update_open(client, |open| {
            open.insert(OpenState::OPEN_RECEIVED);
            if open.contains(OpenState::LOCAL_READY) {
                open.insert(OpenState::OPEN_ESTABLISHED);
                true
            } else {
                false
            }
        });
        match ready {
            Some(true) => self.send_open_ack(client),
            Some(false) => tracing::debug!("open of {:?} received before local ready", client),
            None => tracing::debug!("open of unregistered client {:?} ignored", client),
        }
    }

    pub(crate) fn on_open_ack(&self, client: ClientId) {
        if self
            .update_open(client, |open| {
                open.insert(OpenState::OPEN_RECEIVED | OpenState::OPEN_ESTABLISHED)
            })
            .is_none()
        {
            tracing::debug!("open ack of unregistered client {:?} ignored", client);
        }
    }

    /// On a passive node, keeps asking the peer to open `client` until it is established.
    ///
    /// Returns immediately on any other role or when the client needs no open. A lost
    /// peer releases the caller with [`Error::ContactLost`].
    pub fn sync_open(&self, client: ClientId, timeout: Duration) -> Result<(), Error> {
        if self.status.role() != Role::Passive {
            return Ok(());
        }
        let open = self
            .open_state(client)
            .ok_or(Error::NotRegistered(client))?;
        if !open.contains(OpenState::OPEN_REQUIRED) {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let epoch = self.open.lock().unwrap_or_else(PoisonError::into_inner).contact_epoch;
        loop {
            let (generation, current_epoch) = {
                let monitor = self.open.lock().unwrap_or_else(PoisonError::into_inner);
                (monitor.generation, monitor.contact_epoch)
            };
            if current_epoch != epoch {
                return Err(Error::ContactLost);
            }
            match self.open_state(client) {
                None => return Err(Error::NotRegistered(client)),
                Some(open) if open.contains(OpenState::OPEN_ESTABLISHED) => return Ok(()),
                Some(_) => {}
            }
            if !self.status.peer_alive() {
                return Err(Error::PeerNotPresent);
            }
            if let Err(e) = self.send_service(&ServiceMessage::Open { client }, ServiceToken::Open(client)) {
                tracing::debug!("open of {:?} not sent: {}", client, e);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("open handshake"));
            }
            let wait = self.open_retry.min(deadline - now);
            let monitor = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = self
                .open_changed
                .wait_timeout_while(monitor, wait, |m| m.generation == generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl HandshakeSender for ClientRegistry {
    fn send_handshake(&self, handshake: Handshake) {
        tracing::trace!("sending {:?}", handshake);
        if let Err(e) = self.send_service(&ServiceMessage::Handshake(handshake), ServiceToken::Handshake) {
            tracing::debug!("handshake not sent: {}", e);
        }
    }
}
