//! The CMI service: wires role negotiation, the client registry, the forwarding engine
//! and the panic arbiter to one transport.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arbiter::{ArbiterState, PanicArbiter};
use crate::conduit::{ChannelDirectory, ClientId, ConduitId, SpId};
use crate::config::CmiConfig;
use crate::io::{ForwardError, IoConsumer, IoEngine, Operation};
use crate::message::{self as codec, Handshake, ServiceMessage, ServiceToken};
use crate::registry::{ClientCallback, ClientEvent, ClientRegistry, RegistrationContext};
use crate::role::{HandshakeSender, NodeStatus, Role, RoleNegotiator};
use crate::stats::ConduitStatistics;
use crate::transport::{EventSink, MessageContext, Transport, TransportEvent};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceState {
    Initializing = 0,
    Running = 1,
    Disabled = 2,
    Destroyed = 3,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceState::Initializing,
            1 => ServiceState::Running,
            2 => ServiceState::Disabled,
            _ => ServiceState::Destroyed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmiInfo {
    pub sp: SpId,
    pub role: Role,
    pub peer_role: Option<Role>,
    pub peer_alive: bool,
    pub peer_degraded: bool,
    pub traffic_enabled: bool,
    pub state: ServiceState,
    pub panic: ArbiterState,
    pub io_ready: bool,
    pub peer_table: bool,
    pub waiting_ops: usize,
    pub outstanding_ops: usize,
}

pub struct CmiService {
    config: CmiConfig,
    status: Arc<NodeStatus>,
    transport: Arc<dyn Transport>,
    registry: Arc<ClientRegistry>,
    negotiator: RoleNegotiator,
    engine: Arc<IoEngine>,
    arbiter: PanicArbiter,
    state: AtomicU8,
}

impl CmiService {
    pub fn new(
        config: CmiConfig,
        transport: Arc<dyn Transport>,
        consumer: Arc<dyn IoConsumer>,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let status = Arc::new(NodeStatus::new());
        let registry = Arc::new(ClientRegistry::new(
            ChannelDirectory::new(&config),
            Arc::clone(&transport),
            Arc::clone(&status),
            config.open_retry(),
        ));
        let negotiator = RoleNegotiator::new(config.sp, Arc::clone(&status));
        negotiator.start(
            Arc::clone(&registry) as Arc<dyn HandshakeSender>,
            config.handshake_retry(),
        )?;
        let engine = IoEngine::new(
            &config,
            negotiator.incarnation(),
            Arc::clone(&registry),
            Arc::clone(&status),
            consumer,
        )?;
        let arbiter = PanicArbiter::new(config.sp, Arc::clone(&registry), Arc::clone(&status));

        let service = Arc::new(CmiService {
            config,
            status,
            transport,
            registry,
            negotiator,
            engine,
            arbiter,
            state: AtomicU8::new(ServiceState::Initializing as u8),
        });
        service.registry.register(
            ClientId::Service,
            Arc::new(ServiceClient(Arc::downgrade(&service))),
            Arc::new(()),
        )?;
        service
            .registry
            .register(ClientId::SepIo, service.engine.client(), Arc::new(()))?;
        service
            .transport
            .attach(Arc::downgrade(&service) as Weak<dyn EventSink>);
        Ok(service)
    }

    /// Negotiates the role, opens the conduits of this package and brings up the engine.
    pub fn start(&self) -> Result<Role, Error> {
        self.transport.open_conduit(ConduitId::Service)?;
        let role = self
            .negotiator
            .wait_settled(self.config.settle_timeout(), self.config.handshake_retry())?;

        let conduits = self.registry.directory().conduits_to_open(role);
        for conduit in &conduits {
            if *conduit != ConduitId::Service {
                self.transport.open_conduit(*conduit)?;
            }
        }
        if conduits.iter().any(|c| matches!(c, ConduitId::SepIo(_))) {
            self.engine.init()?;
            self.engine.trigger_exchange();
        }
        self.set_state(ServiceState::Running);
        tracing::info!(
            "{}: cmi service running as {:?}, {} conduits open",
            self.config.sp,
            role,
            conduits.len()
        );
        Ok(role)
    }

    #[inline]
    pub fn config(&self) -> &CmiConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    #[inline]
    pub fn engine(&self) -> &Arc<IoEngine> {
        &self.engine
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.status.role()
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServiceState) {
        let prev = ServiceState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            tracing::debug!("service state {:?} -> {:?}", prev, state);
        }
    }

    pub fn info(&self) -> CmiInfo {
        let role = self.negotiator.snapshot();
        CmiInfo {
            sp: self.config.sp,
            role: role.role,
            peer_role: role.peer_role,
            peer_alive: role.peer_alive,
            peer_degraded: role.peer_degraded,
            traffic_enabled: self.registry.traffic_enabled(),
            state: self.state(),
            panic: self.arbiter.state(),
            io_ready: self.engine.has_local_table(),
            peer_table: self.engine.has_peer_table(),
            waiting_ops: self.engine.waiting_len(),
            outstanding_ops: self.engine.outstanding_len(),
        }
    }

    pub fn enable_traffic(&self) {
        self.registry.enable_traffic();
        if self.state() == ServiceState::Disabled {
            self.set_state(ServiceState::Running);
        }
    }

    pub fn disable_traffic(&self, timeout: Duration) -> Result<(), Error> {
        if self.state() == ServiceState::Running {
            self.set_state(ServiceState::Disabled);
        }
        self.registry.disable_traffic(timeout)
    }

    pub fn stats(&self, conduit: ConduitId) -> Result<ConduitStatistics, Error> {
        self.engine.stats().get(conduit)
    }

    pub fn stats_snapshot(&self) -> Vec<(ConduitId, ConduitStatistics)> {
        self.engine.stats().snapshot()
    }

    pub fn clear_stats(&self, conduit: ConduitId) -> Result<(), Error> {
        self.engine.stats().clear(conduit)
    }

    pub fn enter_service_mode(&self) {
        self.negotiator.enter_service_mode();
    }

    pub fn leave_service_mode(&self) {
        self.negotiator.leave_service_mode();
    }

    pub fn request_panic_permission(&self, timeout: Duration) -> Result<bool, Error> {
        self.arbiter.request(timeout)
    }

    pub fn release_panic_permission(&self) {
        self.arbiter.release();
    }

    pub fn register(
        &self,
        client: ClientId,
        callback: Arc<dyn ClientCallback>,
        context: RegistrationContext,
    ) -> Result<(), Error> {
        self.registry.register(client, callback, context)
    }

    pub fn register_with(
        &self,
        client: ClientId,
        callback: Arc<dyn ClientCallback>,
        context: RegistrationContext,
        open_required: bool,
    ) -> Result<(), Error> {
        self.registry
            .register_with(client, callback, context, open_required)
    }

    pub fn unregister(&self, client: ClientId) -> Result<(), Error> {
        if matches!(client, ClientId::Service | ClientId::SepIo) {
            return Err(Error::InvalidClient(client));
        }
        self.registry.unregister(client)
    }

    pub fn mark_ready(&self, client: ClientId) -> Result<(), Error> {
        self.registry.mark_ready(client)
    }

    pub fn sync_open(&self, client: ClientId, timeout: Duration) -> Result<(), Error> {
        self.registry.sync_open(client, timeout)
    }

    pub fn send(
        &self,
        client: ClientId,
        conduit: ConduitId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
    ) -> Result<(), Error> {
        if matches!(client, ClientId::Service | ClientId::SepIo) {
            return Err(Error::InvalidClient(client));
        }
        self.registry.send(client, conduit, payload, context)
    }

    pub fn forward(&self, op: Operation) -> Result<(), ForwardError> {
        self.engine.forward(op)
    }

    pub fn send_memory(
        &self,
        client: ClientId,
        context: Option<MessageContext>,
        message: &[u8],
    ) -> Result<(), Error> {
        self.engine.send_memory(client, context, message)
    }

    /// Tears the service down. Later calls are no-ops.
    pub fn destroy(&self) {
        let prev = ServiceState::from_u8(
            self.state
                .swap(ServiceState::Destroyed as u8, Ordering::AcqRel),
        );
        if prev == ServiceState::Destroyed {
            return;
        }
        self.engine.destroy();
        let _ = self.registry.unregister(ClientId::SepIo);
        self.negotiator.shutdown();
        self.transport.detach();
        tracing::info!("{}: cmi service destroyed", self.config.sp);
    }

    fn on_service_message(&self, bytes: &[u8]) {
        let msg: ServiceMessage = match codec::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("undecodable service message: {}", e);
                return;
            }
        };
        match msg {
            ServiceMessage::Handshake(handshake) => self.handle_handshake(handshake),
            ServiceMessage::Open { client } => self.registry.on_open_request(client),
            ServiceMessage::OpenAck { client } => self.registry.on_open_ack(client),
            ServiceMessage::PanicRequest { sp, nonce } => self.arbiter.on_request(sp, nonce),
            ServiceMessage::PanicReply { nonce, granted } => self.arbiter.on_reply(nonce, granted),
            ServiceMessage::PanicRelease { sp } => self.arbiter.on_release(sp),
        }
    }

    fn handle_handshake(&self, handshake: Handshake) {
        let outcome = self.negotiator.on_handshake_received(handshake);
        if outcome.peer_restarted {
            tracing::warn!("{}: peer {} restarted, resetting the session", self.config.sp, handshake.sp);
            self.registry.on_contact_lost();
            self.arbiter.on_contact_lost();
        }
        if outcome.role != Role::Busy && !self.engine.has_peer_table() {
            self.engine.trigger_exchange();
        }
    }
}

impl EventSink for CmiService {
    fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ContactLost => {
                tracing::warn!("{}: contact with the peer lost", self.config.sp);
                self.negotiator.on_contact_lost();
                self.registry.on_contact_lost();
                self.arbiter.on_contact_lost();
            }
            other => self.registry.dispatch(other),
        }
    }
}

struct ServiceClient(Weak<CmiService>);

impl ServiceClient {
    fn token(context: Option<MessageContext>) -> Option<ServiceToken> {
        context
            .and_then(|c| c.downcast::<ServiceToken>().ok())
            .map(|t| *t)
    }
}

impl ClientCallback for ServiceClient {
    fn on_event(&self, _client: ClientId, event: ClientEvent<'_>) {
        let service = match self.0.upgrade() {
            Some(service) => service,
            None => return,
        };
        match event {
            ClientEvent::Received { message, .. } => service.on_service_message(message),
            ClientEvent::Transmitted { context, .. } => {
                if let Some(ServiceToken::Handshake) = Self::token(context) {
                    service.negotiator.on_transmit_ack();
                }
            }
            ClientEvent::PeerNotPresent { context, .. } => match Self::token(context) {
                Some(ServiceToken::Handshake) => {
                    service.negotiator.on_peer_not_present();
                }
                Some(ServiceToken::Panic) => service.arbiter.on_send_failed(),
                Some(ServiceToken::Open(client)) => {
                    tracing::debug!("open of {:?} did not reach the peer", client)
                }
                None => {}
            },
            ClientEvent::PeerBusy { conduit, context } | ClientEvent::FatalError { conduit, context } => {
                tracing::warn!("service message {:?} on {} failed", Self::token(context), conduit);
            }
            ClientEvent::ContactLost { .. } => {}
        }
    }
}
