//! I/O forwarding engine.
//!
//! Block and control operations submitted on one node are carried to the peer through
//! pooled staging slots, executed there by the peer's [`IoConsumer`], and completed
//! locally when the matching response arrives. Requests that find no free slot wait in
//! FIFO order. Peer loss fails everything in flight exactly once.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use thiserror::Error;

use crate::conduit::{ClientId, ConduitId};
use crate::config::{CmiConfig, PoolConfig};
use crate::message as codec;
use crate::registry::{ClientCallback, ClientEvent, ClientRegistry};
use crate::role::NodeStatus;
use crate::stats::Statistics;
use crate::transport::MessageContext;

pub mod cancel;
pub mod memory;
pub mod message;
pub mod operation;
pub mod slot;
mod staging;
pub mod table;

pub use memory::MAX_MEMORY_MESSAGE_LEN;
pub use operation::{
    BlockOpcode, BlockOperation, BlockStatus, CancelToken, Completion, ControlOperation,
    ControlStatus, IoConsumer, OpAttrs, OpId, OpStatus, Operation, OperationHeader,
    OperationKind, PendingOperation, SgList, StatusCode, StatusDetail,
};
pub use slot::{PoolClass, SlotKey};
pub use table::TranslationTable;

use cancel::Coordinator;
use self::message::{FloatHeader, IoMessage, PayloadFrame, RequestInfo, ResponseInfo};
use slot::{Acquire, HoldReleased, Lease, PoolGuard, PoolSet, SlotAttrs, POOL_COUNT};
use table::{Accept, Tables};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// An operation the engine did not take. The caller keeps ownership.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Peer not present")]
    PeerNotPresent(Operation),
    #[error("Forwarding engine not ready")]
    NotReady(Operation),
}

impl ForwardError {
    pub fn into_operation(self) -> Operation {
        match self {
            ForwardError::PeerNotPresent(op) | ForwardError::NotReady(op) => op,
        }
    }
}

/// Send context of an engine message.
pub(crate) enum EngineToken {
    Request {
        key: SlotKey,
        origin: OpId,
        hold: slot::Hold,
    },
    Response {
        hold: slot::Hold,
    },
    Memory {
        hold: Option<slot::Hold>,
        client: ClientId,
        context: Option<MessageContext>,
    },
    Table,
    Abort,
    /// Failure response for a request that never got a slot.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxOutcome {
    Transmitted,
    PeerBusy,
    PeerNotPresent,
    FatalError,
}

struct Waiting {
    op: Operation,
    len: usize,
}

struct Outstanding {
    lease: Lease,
    op: Operation,
    conduit: ConduitId,
}

/// A peer request being executed by the local consumer.
struct Processing {
    lease: Lease,
    origin: OpId,
    cancel: CancelToken,
    conduit: ConduitId,
    returns_data: bool,
}

pub struct IoEngine {
    me: Weak<IoEngine>,
    registry: Arc<ClientRegistry>,
    status: Arc<NodeStatus>,
    consumer: Arc<dyn IoConsumer>,
    pool_config: PoolConfig,
    max_sg_fragments: usize,
    drain_timeout: Duration,
    pools: spin::RwLock<Option<Arc<PoolSet>>>,
    tables: Tables,
    // lock order: send pool free lists (Large, Small), then waiting
    waiting: spin::Mutex<VecDeque<Waiting>>,
    outstanding: spin::Mutex<FnvHashMap<SlotKey, Outstanding>>,
    processing: spin::Mutex<FnvHashMap<SlotKey, Processing>>,
    stats: Statistics,
    coordinator: Coordinator,
    abort_in_flight: AtomicBool,
    kicking: AtomicBool,
    kick_pending: AtomicBool,
}

fn lock_pools(pools: &PoolSet) -> [PoolGuard<'_>; POOL_COUNT] {
    [
        pools.send(PoolClass::Large).lock(),
        pools.send(PoolClass::Small).lock(),
    ]
}

fn acquire_for(
    guards: &mut [PoolGuard<'_>; POOL_COUNT],
    pools: &PoolSet,
    len: usize,
) -> Option<Lease> {
    pools
        .classes_for(len)
        .find_map(|class| guards[class.index()].acquire())
}

impl IoEngine {
    pub fn new(
        config: &CmiConfig,
        incarnation: u64,
        registry: Arc<ClientRegistry>,
        status: Arc<NodeStatus>,
        consumer: Arc<dyn IoConsumer>,
    ) -> Result<Arc<Self>, crate::Error> {
        let engine = Arc::new_cyclic(|me| IoEngine {
            me: me.clone(),
            stats: Statistics::new(registry.directory().io_conduit_count()),
            registry,
            status,
            consumer,
            pool_config: config.pools.clone(),
            max_sg_fragments: config.max_sg_fragments,
            drain_timeout: config.drain_timeout(),
            pools: spin::RwLock::new(None),
            tables: Tables::new(incarnation),
            waiting: spin::Mutex::new(VecDeque::new()),
            outstanding: spin::Mutex::new(FnvHashMap::default()),
            processing: spin::Mutex::new(FnvHashMap::default()),
            coordinator: Coordinator::new(),
            abort_in_flight: AtomicBool::new(false),
            kicking: AtomicBool::new(false),
            kick_pending: AtomicBool::new(false),
        });
        engine.coordinator.start(Arc::downgrade(&engine))?;
        Ok(engine)
    }

    /// Callback to register for [`ClientId::SepIo`]. Holds the engine weakly.
    pub fn client(self: &Arc<Self>) -> Arc<dyn ClientCallback> {
        Arc::new(EngineClient(Arc::downgrade(self)))
    }

    /// Maps the staging pools and publishes the local translation table.
    pub fn init(&self) -> Result<TranslationTable, crate::Error> {
        let pools = {
            let mut guard = self.pools.write();
            match guard.as_ref() {
                Some(pools) => Arc::clone(pools),
                None => {
                    let pools = Arc::new(PoolSet::new(&self.pool_config)?);
                    *guard = Some(Arc::clone(&pools));
                    pools
                }
            }
        };
        let table = self.tables.publish_local(&pools);
        tracing::info!(
            "io engine ready: {} large and {} small slots, epoch {}",
            table.slots[PoolClass::Large.index()],
            table.slots[PoolClass::Small.index()],
            table.epoch
        );
        Ok(table)
    }

    #[inline]
    fn pools(&self) -> Option<Arc<PoolSet>> {
        self.pools.read().clone()
    }

    #[inline]
    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn has_local_table(&self) -> bool {
        self.tables.local_valid()
    }

    pub fn has_peer_table(&self) -> bool {
        self.tables.peer_valid()
    }

    pub fn exchange_in_flight(&self) -> bool {
        self.tables.exchange_in_flight()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.lock().len()
    }

    /// Every slot is back in its pool. True before `init`.
    pub fn pools_idle(&self) -> bool {
        self.pools().map_or(true, |p| p.is_idle())
    }

    /// Sends `operation` to the peer.
    ///
    /// Once this returns `Ok` the operation completes exactly once through its sink.
    pub fn forward(&self, op: Operation) -> Result<(), ForwardError> {
        if !self.status.peer_alive() {
            return Err(ForwardError::PeerNotPresent(op));
        }
        let pools = match self.pools() {
            Some(pools) if self.tables.local_valid() => pools,
            _ => return Err(ForwardError::NotReady(op)),
        };

        let len = op.transfer_len();
        let invalid = op.validate().err().or_else(|| {
            (len > pools.max_len())
                .then(|| format!("{} bytes exceed the slot size {}", len, pools.max_len()))
        });
        if let Some(reason) = invalid {
            tracing::error!("{} rejected: {}", op.id(), reason);
            op.complete_with(StatusCode::GenericFailure);
            return Ok(());
        }

        self.arm_cancel(&op);

        if !self.tables.peer_valid() {
            tracing::debug!("{} waits for the peer table", op.id());
            self.park(op, len, false);
            return Ok(());
        }

        let ready = {
            let mut guards = lock_pools(&pools);
            let mut waiting = self.waiting.lock();
            let lease = if waiting.is_empty() {
                acquire_for(&mut guards, &pools, len)
            } else {
                None
            };
            match lease {
                Some(lease) => Some((lease, op)),
                None => {
                    tracing::trace!("{} queued behind {} waiting", op.id(), waiting.len());
                    waiting.push_back(Waiting { op, len });
                    None
                }
            }
        };
        if let Some((lease, op)) = ready {
            self.start(lease, op);
        }
        Ok(())
    }

    fn arm_cancel(&self, op: &Operation) {
        let me = self.me.clone();
        op.cancel_token().on_cancel(Arc::new(move || {
            if let Some(engine) = me.upgrade() {
                engine.coordinator.notify();
            }
        }));
    }

    fn start(&self, mut lease: Lease, op: Operation) {
        let peer = match self.tables.peer() {
            Some(peer) => peer,
            None => {
                lease.finish();
                let len = op.transfer_len();
                self.park(op, len, true);
                return;
            }
        };
        let key = lease.key();
        let conduit = self.registry.directory().io_conduit(op.header().cpu_id);
        let data_len = op.transfer_len();
        let fragmented = op.payload().segment_count() >= self.max_sg_fragments;

        let payload = if op.request_len() == 0 {
            PayloadFrame::None
        } else if !fragmented {
            PayloadFrame::Direct(op.payload().segments().to_vec())
        } else {
            let staged = op.payload().gather_into(lease.staging_mut(data_len));
            PayloadFrame::Staged(lease.staging(staged).to_vec())
        };
        if fragmented && op.returns_data() {
            lease.set_attrs(SlotAttrs::READ_COPY_NEEDED);
        }

        let request = RequestInfo {
            float: FloatHeader {
                key,
                origin: op.id(),
                address: peer.receive_addr(key),
                data_len: data_len as u32,
            },
            header: *op.header(),
            kind: *op.kind(),
            payload,
        };
        let bytes = match codec::encode(&IoMessage::PacketRequest(request)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("encode request {}: {}", op.id(), e);
                lease.finish();
                op.complete_with(StatusCode::GenericFailure);
                self.start_from_waiting();
                return;
            }
        };

        tracing::trace!("{} started in {} on {}", op.id(), key, conduit);
        self.stats.record_sent(conduit, data_len);
        let origin = op.id();
        let hold = lease.hold();
        self.outstanding
            .lock()
            .insert(key, Outstanding { lease, op, conduit });
        match hold {
            Some(hold) => {
                let token: MessageContext = Box::new(EngineToken::Request { key, origin, hold });
                // failures come back through the callback
                let _ = self
                    .registry
                    .send(ClientId::SepIo, conduit, bytes, Some(token));
            }
            None => self.start_failed(key, origin, StatusCode::GenericFailure),
        }
    }

    /// Queues `op` until the peer table arrives. The peer check runs under the queue lock,
    /// so an operation either lands before `on_peer_lost` drains the queue or fails here.
    fn park(&self, op: Operation, len: usize, front: bool) {
        let mut waiting = self.waiting.lock();
        if !(self.status.peer_alive() && self.tables.local_valid()) {
            drop(waiting);
            tracing::debug!("{} failed, the peer went away before it started", op.id());
            op.complete_with(StatusCode::Failed);
            return;
        }
        let entry = Waiting { op, len };
        if front {
            waiting.push_front(entry);
        } else {
            waiting.push_back(entry);
        }
        drop(waiting);
        self.trigger_exchange();
    }

    /// Fails the operation `origin` started in `key`, if the slot still carries it.
    fn start_failed(&self, key: SlotKey, origin: OpId, code: StatusCode) {
        let entry = {
            let mut outstanding = self.outstanding.lock();
            match outstanding.get(&key) {
                Some(entry) if entry.op.id() == origin => outstanding.remove(&key),
                _ => None,
            }
        };
        match entry {
            Some(Outstanding { lease, op, conduit }) => {
                tracing::debug!("{} in {} failed to start: {:?}", op.id(), key, code);
                self.stats.record_send_error(conduit);
                lease.finish();
                op.complete_with(code);
                self.start_from_waiting();
            }
            None => tracing::debug!("send failure for retired slot {}", key),
        }
    }

    /// Starts waiting operations while slots are free. Never recurses.
    pub(crate) fn start_from_waiting(&self) {
        self.kick_pending.store(true, Ordering::Release);
        loop {
            if self.kicking.swap(true, Ordering::AcqRel) {
                return;
            }
            while self.kick_pending.swap(false, Ordering::AcqRel) {
                self.drain_waiting();
            }
            self.kicking.store(false, Ordering::Release);
            if !self.kick_pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn drain_waiting(&self) {
        let pools = match self.pools() {
            Some(pools) => pools,
            None => return,
        };
        if !self.tables.local_valid() || !self.tables.peer_valid() {
            return;
        }
        let mut cancelled = Vec::new();
        let mut ready = Vec::new();
        {
            let mut guards = lock_pools(&pools);
            let mut waiting = self.waiting.lock();
            loop {
                let len = match waiting.front() {
                    None => break,
                    Some(head) if head.op.is_cancelled() => {
                        cancelled.extend(waiting.pop_front().map(|w| w.op));
                        continue;
                    }
                    Some(head) => head.len,
                };
                match acquire_for(&mut guards, &pools, len) {
                    Some(lease) => ready.extend(waiting.pop_front().map(|w| (lease, w.op))),
                    None => break,
                }
            }
        }
        for op in cancelled {
            tracing::debug!("{} cancelled while waiting", op.id());
            op.complete_with(StatusCode::Cancelled);
        }
        for (lease, op) in ready {
            self.start(lease, op);
        }
    }

    /// Sends the local table unless an exchange is already in flight.
    pub fn trigger_exchange(&self) {
        if !self.tables.local_valid() {
            return;
        }
        if self.tables.try_begin_exchange() {
            self.send_table();
        }
    }

    fn send_table(&self) {
        let table = match self.tables.local() {
            Some(table) => table,
            None => {
                self.tables.reset_exchange();
                return;
            }
        };
        let msg = IoMessage::TranslationInfo {
            table,
            have_peer_table: self.tables.peer_valid(),
        };
        match codec::encode(&msg) {
            Ok(bytes) => {
                tracing::debug!("sending translation table, epoch {}", table.epoch);
                let _ = self.registry.send(
                    ClientId::SepIo,
                    ConduitId::SepIo(0),
                    bytes,
                    Some(Box::new(EngineToken::Table)),
                );
            }
            Err(e) => {
                tracing::error!("encode translation table: {}", e);
                self.tables.reset_exchange();
            }
        }
    }

    fn on_message(&self, conduit: ConduitId, bytes: &[u8]) {
        let msg: IoMessage = match codec::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("undecodable io message on {}: {}", conduit, e);
                self.stats.record_receive_error(conduit);
                return;
            }
        };
        if !self.tables.local_valid() {
            tracing::info!("{} dropped: io engine not ready", msg.name());
            return;
        }
        if !self.tables.peer_valid() && !matches!(msg, IoMessage::TranslationInfo { .. }) {
            tracing::info!("{} dropped: no peer table", msg.name());
            return;
        }
        match msg {
            IoMessage::TranslationInfo {
                table,
                have_peer_table,
            } => self.on_translation_info(table, have_peer_table),
            IoMessage::PacketRequest(request) => self.on_request(conduit, request),
            IoMessage::PacketResponse(response) => self.on_response(response),
            IoMessage::PacketAbort { key, origin } => self.on_abort(key, origin),
            IoMessage::SendMemory {
                key,
                client,
                message,
            } => {
                tracing::trace!("memory message from {:?} for {:?}", key, client);
                self.registry.deliver_received(client, conduit, &message);
            }
        }
    }

    fn on_translation_info(&self, table: TranslationTable, have_peer_table: bool) {
        match self.tables.accept_peer(table) {
            Accept::Stale => {
                tracing::debug!("stale peer table, epoch {}", table.epoch);
                return;
            }
            Accept::GeometryMismatch => {
                tracing::error!("peer pool geometry {:?} differs from ours", table.slot_len);
                return;
            }
            Accept::Stored => tracing::info!("peer translation table stored, epoch {}", table.epoch),
        }
        if !have_peer_table && self.tables.begin_reply() {
            self.send_table();
        }
        self.start_from_waiting();
    }

    fn on_request(&self, conduit: ConduitId, request: RequestInfo) {
        let (pools, local) = match (self.pools(), self.tables.local()) {
            (Some(pools), Some(local)) => (pools, local),
            _ => return,
        };
        let float = request.float;
        let pool = pools.receive(float.key.pool);
        let valid = float.key.slot < pool.slot_count()
            && float.address == local.receive_addr(float.key)
            && (float.data_len as usize) <= pool.slot_len()
            && request.payload.len() <= pool.slot_len();
        if !valid {
            tracing::error!(
                "request {} for {} at {:#x} does not match the receive table",
                float.origin,
                float.key,
                float.address
            );
            self.stats.record_receive_error(conduit);
            self.reject(conduit, float);
            return;
        }
        match pool.acquire_at(float.key.slot, request) {
            Acquire::Ready(lease, request) => self.start_request(lease, request),
            Acquire::Parked => tracing::debug!("request {} parked on {}", float.origin, float.key),
            Acquire::Busy(_) | Acquire::Invalid(_) => {
                tracing::error!("request {} for {} which is in use", float.origin, float.key);
                self.stats.record_receive_error(conduit);
                self.reject(conduit, float);
            }
        }
    }

    fn reject(&self, conduit: ConduitId, float: FloatHeader) {
        let msg = IoMessage::PacketResponse(ResponseInfo {
            float,
            status: OpStatus::new(StatusCode::GenericFailure),
            detail: StatusDetail::None,
            payload: None,
        });
        if let Ok(bytes) = codec::encode(&msg) {
            let _ = self.registry.send(
                ClientId::SepIo,
                conduit,
                bytes,
                Some(Box::new(EngineToken::Reject)),
            );
        }
    }

    /// Hands a peer request, now owning its receive slot, to the local consumer.
    fn start_request(&self, mut lease: Lease, request: RequestInfo) {
        let key = request.float.key;
        let origin = request.float.origin;
        let conduit = self.registry.directory().io_conduit(request.header.cpu_id);
        let data_len = request.float.data_len as usize;
        self.stats.record_received(conduit, request.payload.len());

        let returns_data = match &request.kind {
            OperationKind::Block(block) => block.opcode.returns_data(),
            OperationKind::Control(_) => true,
        };
        let payload = match request.payload {
            PayloadFrame::None if returns_data => SgList::zeroed(data_len, 1),
            PayloadFrame::None => SgList::new(),
            PayloadFrame::Staged(data) => {
                let dst = lease.staging_mut(data.len());
                let n = dst.len();
                dst.copy_from_slice(&data[..n]);
                SgList::single(lease.staging(n).to_vec())
            }
            PayloadFrame::Direct(segments) => SgList::from_segments(segments),
        };

        let mut header = request.header;
        header.attributes.insert(OpAttrs::REDIRECTED);
        let cancel = CancelToken::new();
        self.processing.lock().insert(
            key,
            Processing {
                lease,
                origin,
                cancel: cancel.clone(),
                conduit,
                returns_data,
            },
        );

        let me = self.me.clone();
        let op = Operation::with_hook(
            header,
            request.kind,
            payload,
            cancel,
            Box::new(move |completion| {
                if let Some(engine) = me.upgrade() {
                    engine.complete_local(key, origin, completion);
                }
            }),
        );
        tracing::trace!("peer request {} in {} submitted as {}", origin, key, op.id());
        self.consumer.submit(op);
    }

    /// Completion of a peer request: answers it and lets the slot go with the response.
    fn complete_local(&self, key: SlotKey, origin: OpId, completion: Completion) {
        let entry = {
            let mut processing = self.processing.lock();
            match processing.remove(&key) {
                Some(entry) if entry.origin == origin => Some(entry),
                Some(entry) => {
                    processing.insert(key, entry);
                    None
                }
                None => None,
            }
        };
        let Processing {
            mut lease,
            conduit,
            returns_data,
            ..
        } = match entry {
            Some(entry) => entry,
            None => {
                tracing::error!("completion of {} for {} has no processing entry", origin, key);
                return;
            }
        };

        let payload = if returns_data {
            let data = completion.payload.gather();
            let dst = lease.staging_mut(data.len());
            let n = dst.len();
            dst.copy_from_slice(&data[..n]);
            Some(lease.staging(n).to_vec())
        } else {
            None
        };
        let float = FloatHeader {
            key,
            origin,
            address: self.tables.peer().map_or(0, |peer| peer.send_addr(key)),
            data_len: payload.as_ref().map_or(0, |p| p.len() as u32),
        };
        let msg = IoMessage::PacketResponse(ResponseInfo {
            float,
            status: completion.status,
            detail: completion.detail,
            payload,
        });
        let bytes = match codec::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("encode response for {}: {}", origin, e);
                lease.finish();
                return;
            }
        };
        let hold = lease.hold();
        lease.finish();
        if let Some(hold) = hold {
            let _ = self.registry.send(
                ClientId::SepIo,
                conduit,
                bytes,
                Some(Box::new(EngineToken::Response { hold })),
            );
        }
    }

    fn on_response(&self, response: ResponseInfo) {
        let key = response.float.key;
        let entry = self.outstanding.lock().remove(&key);
        let Outstanding {
            mut lease,
            op,
            conduit,
        } = match entry {
            Some(entry) => entry,
            None => {
                tracing::warn!("response for idle slot {} dropped", key);
                return;
            }
        };
        if op.id() != response.float.origin {
            tracing::error!(
                "response in {} is for {}, slot holds {}; dropped",
                key,
                response.float.origin,
                op.id()
            );
            self.outstanding
                .lock()
                .insert(key, Outstanding { lease, op, conduit });
            return;
        }
        if let Some(local) = self.tables.local() {
            if response.float.address != 0 && response.float.address != local.send_addr(key) {
                tracing::warn!("response for {} carries address {:#x}", key, response.float.address);
            }
        }

        let data = match response.payload {
            Some(data) if op.returns_data() && !data.is_empty() => {
                if lease.attrs().contains(SlotAttrs::READ_COPY_NEEDED) {
                    let dst = lease.staging_mut(data.len());
                    let n = dst.len();
                    dst.copy_from_slice(&data[..n]);
                    Some(lease.staging(n).to_vec())
                } else {
                    Some(data)
                }
            }
            _ => None,
        };
        lease.finish();
        tracing::trace!("{} in {} completed: {:?}", op.id(), key, response.status.code);
        match data {
            Some(data) => op.complete_with_data(response.status, response.detail, &data),
            None => op.complete(response.status, response.detail),
        }
        self.start_from_waiting();
    }

    fn on_abort(&self, key: SlotKey, origin: OpId) {
        let token = match self.processing.lock().get(&key) {
            Some(entry) if entry.origin == origin => Some(entry.cancel.clone()),
            _ => None,
        };
        match token {
            Some(token) => {
                tracing::debug!("peer aborted {} in {}", origin, key);
                token.cancel();
            }
            None => tracing::debug!("abort for {} in {} matched nothing", origin, key),
        }
    }

    fn on_transmit(&self, conduit: ConduitId, context: Option<MessageContext>, outcome: TxOutcome) {
        let token = match context.map(|c| c.downcast::<EngineToken>()) {
            Some(Ok(token)) => *token,
            _ => {
                tracing::warn!("{:?} on {} without engine context", outcome, conduit);
                return;
            }
        };
        match token {
            EngineToken::Request { key, origin, hold } => {
                let code = match outcome {
                    TxOutcome::Transmitted => None,
                    TxOutcome::PeerBusy => Some(StatusCode::PeerBusy),
                    TxOutcome::PeerNotPresent | TxOutcome::FatalError => Some(StatusCode::Failed),
                };
                // before the hold goes, so the slot cannot be handed to another operation
                if let Some(code) = code {
                    if self.tables.local_valid() {
                        self.start_failed(key, origin, code);
                    }
                }
                self.release_hold(hold);
            }
            EngineToken::Response { hold } => {
                if outcome != TxOutcome::Transmitted {
                    tracing::debug!("response in {} not delivered: {:?}", hold.key(), outcome);
                    self.stats.record_send_error(conduit);
                }
                self.release_hold(hold);
            }
            EngineToken::Memory {
                hold,
                client,
                context,
            } => {
                if let Some(hold) = hold {
                    self.release_hold(hold);
                }
                let event = match outcome {
                    TxOutcome::Transmitted => ClientEvent::Transmitted { conduit, context },
                    TxOutcome::PeerBusy => ClientEvent::PeerBusy { conduit, context },
                    TxOutcome::PeerNotPresent => ClientEvent::PeerNotPresent { conduit, context },
                    TxOutcome::FatalError => ClientEvent::FatalError { conduit, context },
                };
                self.registry.deliver(client, event);
            }
            EngineToken::Table => {
                if outcome != TxOutcome::Transmitted {
                    tracing::debug!("translation table not delivered: {:?}", outcome);
                }
                if self.tables.end_exchange() {
                    self.send_table();
                }
            }
            EngineToken::Abort => {
                self.abort_in_flight.store(false, Ordering::Release);
                self.coordinator.notify();
            }
            EngineToken::Reject => {}
        }
    }

    fn release_hold(&self, hold: slot::Hold) {
        match hold.release() {
            HoldReleased::Returned => self.start_from_waiting(),
            HoldReleased::StillLeased => {}
            HoldReleased::Restart(lease, request) => self.start_request(lease, *request),
        }
    }

    /// Fails every queued and outstanding operation and forgets the peer table.
    pub fn on_peer_lost(&self) {
        // invalidate first so concurrent starts park instead of sending
        self.tables.invalidate_peer();
        self.tables.reset_exchange();
        let waiting: Vec<_> = self.waiting.lock().drain(..).collect();
        let outstanding: Vec<_> = self
            .outstanding
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        self.abort_in_flight.store(false, Ordering::Release);

        if !waiting.is_empty() || !outstanding.is_empty() {
            tracing::info!(
                "peer lost: failing {} waiting and {} outstanding operations",
                waiting.len(),
                outstanding.len()
            );
        }
        for w in waiting {
            w.op.complete_with(StatusCode::Failed);
        }
        for entry in outstanding {
            entry.lease.finish();
            entry.op.complete_with(StatusCode::Failed);
        }
    }

    /// Stops the engine and waits, bounded, for every slot to come home.
    pub fn destroy(&self) {
        self.tables.invalidate_local();
        self.on_peer_lost();
        self.coordinator.stop();

        if let Some(pools) = self.pools() {
            let deadline = Instant::now() + self.drain_timeout;
            while !(pools.is_idle() && self.processing.lock().is_empty()) {
                if Instant::now() >= deadline {
                    tracing::error!(
                        "io engine destroyed with {} requests in processing and slots still held",
                        self.processing.lock().len()
                    );
                    break;
                }
                thread::sleep(DRAIN_POLL);
            }
        }
        self.pools.write().take();
        tracing::info!("io engine destroyed");
    }
}

struct EngineClient(Weak<IoEngine>);

impl ClientCallback for EngineClient {
    fn on_event(&self, _client: ClientId, event: ClientEvent<'_>) {
        let engine = match self.0.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        match event {
            ClientEvent::Received {
                conduit, message, ..
            } => engine.on_message(conduit, message),
            ClientEvent::ContactLost { .. } => engine.on_peer_lost(),
            ClientEvent::Transmitted { conduit, context } => {
                engine.on_transmit(conduit, context, TxOutcome::Transmitted)
            }
            ClientEvent::PeerBusy { conduit, context } => {
                engine.on_transmit(conduit, context, TxOutcome::PeerBusy)
            }
            ClientEvent::PeerNotPresent { conduit, context } => {
                engine.on_transmit(conduit, context, TxOutcome::PeerNotPresent)
            }
            ClientEvent::FatalError { conduit, context } => {
                engine.on_transmit(conduit, context, TxOutcome::FatalError)
            }
        }
    }
}
