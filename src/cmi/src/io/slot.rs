//! Staging slots and the two tokens that own them.
//!
//! A slot is logically owned by a [`Lease`] and may additionally be referenced by the
//! transport through a [`Hold`] while a message that uses it is in flight. The slot
//! goes back to its pool once both are gone. Both tokens are consumed by value.
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::message::RequestInfo;
use super::staging::StagingRegion;
use crate::config::PoolConfig;

pub const POOL_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PoolClass {
    Large = 0,
    Small = 1,
}

impl PoolClass {
    pub const ALL: [PoolClass; POOL_COUNT] = [PoolClass::Large, PoolClass::Small];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub pool: PoolClass,
    pub slot: u32,
}

impl SlotKey {
    #[inline]
    pub const fn new(pool: PoolClass, slot: u32) -> Self {
        SlotKey { pool, slot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool {
            PoolClass::Large => write!(f, "L{}", self.slot),
            PoolClass::Small => write!(f, "S{}", self.slot),
        }
    }
}

bitflags! {
    #[derive(Default)]
    pub struct SlotAttrs: u32 {
        const ABORT_SENT = 0b001;
        const READ_COPY_NEEDED = 0b010;
        const MEMORY_SENT = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Leased, no message in flight.
    Acquired,
    /// Leased and referenced by the transport.
    Held,
    /// Lease finished; waiting for the transport.
    HeldPendingReturn,
    /// Like `HeldPendingReturn`, with a new request parked behind the hold.
    HeldNeedStart,
}

struct SlotInner {
    state: SlotState,
    attrs: SlotAttrs,
    parked: Option<Box<RequestInfo>>,
}

impl Default for SlotInner {
    fn default() -> Self {
        SlotInner {
            state: SlotState::Free,
            attrs: SlotAttrs::empty(),
            parked: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Slots are handed out from a free list.
    Send,
    /// Slots are addressed by the peer.
    Receive,
}

pub struct SlotPool {
    class: PoolClass,
    kind: PoolKind,
    slot_len: usize,
    slots: Box<[spin::Mutex<SlotInner>]>,
    free: spin::Mutex<VecDeque<u32>>,
    region: StagingRegion,
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("class", &self.class)
            .field("kind", &self.kind)
            .field("slot_len", &self.slot_len)
            .field("slots", &self.slots.len())
            .finish()
    }
}

pub(crate) enum Acquire {
    Ready(Lease, RequestInfo),
    /// Parked behind a response still held by the transport.
    Parked,
    Busy(RequestInfo),
    Invalid(RequestInfo),
}

impl SlotPool {
    pub fn new(class: PoolClass, kind: PoolKind, slot_len: usize, count: u32) -> io::Result<Self> {
        let region = StagingRegion::new(slot_len * count as usize)?;
        let slots = (0..count)
            .map(|_| spin::Mutex::new(SlotInner::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = match kind {
            PoolKind::Send => (0..count).collect(),
            PoolKind::Receive => VecDeque::new(),
        };
        Ok(SlotPool {
            class,
            kind,
            slot_len,
            slots,
            free: spin::Mutex::new(free),
            region,
        })
    }

    #[inline]
    pub fn class(&self) -> PoolClass {
        self.class
    }

    #[inline]
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.region.addr()
    }

    pub fn free_count(&self) -> usize {
        match self.kind {
            PoolKind::Send => self.free.lock().len(),
            PoolKind::Receive => self
                .slots
                .iter()
                .filter(|s| s.lock().state == SlotState::Free)
                .count(),
        }
    }

    /// Every slot is back in the pool.
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.lock().state == SlotState::Free)
    }

    pub fn state(&self, slot: u32) -> Option<SlotState> {
        self.slots.get(slot as usize).map(|s| s.lock().state)
    }

    /// Locks the free list of a send pool.
    pub(crate) fn lock(self: &Arc<Self>) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            free: self.free.lock(),
        }
    }

    /// Claims the slot a peer request addresses.
    pub(crate) fn acquire_at(self: &Arc<Self>, slot: u32, request: RequestInfo) -> Acquire {
        let cell = match self.slots.get(slot as usize) {
            Some(cell) => cell,
            None => return Acquire::Invalid(request),
        };
        let mut inner = cell.lock();
        match inner.state {
            SlotState::Free => {
                inner.state = SlotState::Acquired;
                inner.attrs = SlotAttrs::empty();
                drop(inner);
                Acquire::Ready(Lease::new(self, slot), request)
            }
            SlotState::HeldPendingReturn => {
                inner.state = SlotState::HeldNeedStart;
                inner.parked = Some(Box::new(request));
                Acquire::Parked
            }
            _ => Acquire::Busy(request),
        }
    }

    fn key(&self, slot: u32) -> SlotKey {
        SlotKey::new(self.class, slot)
    }

    fn give_back(&self, slot: u32) {
        if self.kind == PoolKind::Send {
            self.free.lock().push_back(slot);
        }
    }
}

/// Exclusive access to the free list of a send pool.
pub(crate) struct PoolGuard<'a> {
    pool: &'a Arc<SlotPool>,
    free: spin::MutexGuard<'a, VecDeque<u32>>,
}

impl<'a> PoolGuard<'a> {
    #[inline]
    pub(crate) fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub(crate) fn acquire(&mut self) -> Option<Lease> {
        let slot = self.free.pop_front()?;
        let mut inner = self.pool.slots[slot as usize].lock();
        debug_assert_eq!(inner.state, SlotState::Free);
        inner.state = SlotState::Acquired;
        inner.attrs = SlotAttrs::empty();
        drop(inner);
        Some(Lease::new(self.pool, slot))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Released {
    Returned,
    /// The transport still holds the slot.
    Deferred,
}

pub(crate) enum HoldReleased {
    Returned,
    StillLeased,
    /// A parked request now owns the slot.
    Restart(Lease, Box<RequestInfo>),
}

/// Logical ownership of one slot.
pub struct Lease {
    pool: Arc<SlotPool>,
    slot: u32,
    released: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease({})", self.key())
    }
}

impl Lease {
    fn new(pool: &Arc<SlotPool>, slot: u32) -> Self {
        Lease {
            pool: Arc::clone(pool),
            slot,
            released: false,
        }
    }

    #[inline]
    fn pool(&self) -> &SlotPool {
        &self.pool
    }

    #[inline]
    pub fn key(&self) -> SlotKey {
        self.pool.key(self.slot)
    }

    #[inline]
    pub fn slot_len(&self) -> usize {
        self.pool().slot_len
    }

    pub fn attrs(&self) -> SlotAttrs {
        self.pool().slots[self.slot as usize].lock().attrs
    }

    pub fn set_attrs(&self, attrs: SlotAttrs) {
        self.pool().slots[self.slot as usize].lock().attrs.insert(attrs);
    }

    /// Sets `attrs`, returning false if all of them were already set.
    pub fn test_and_set(&self, attrs: SlotAttrs) -> bool {
        let mut inner = self.pool().slots[self.slot as usize].lock();
        let fresh = !inner.attrs.contains(attrs);
        inner.attrs.insert(attrs);
        fresh
    }

    pub fn staging(&self, len: usize) -> &[u8] {
        let pool = self.pool();
        let len = len.min(pool.slot_len);
        let ptr = pool.region.window(self.slot as usize * pool.slot_len, len);
        // SAFETY: the window belongs to this slot and the lease is its only owner.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    pub fn staging_mut(&mut self, len: usize) -> &mut [u8] {
        let pool = self.pool();
        let len = len.min(pool.slot_len);
        let ptr = pool.region.window(self.slot as usize * pool.slot_len, len);
        // SAFETY: as above, and `&mut self` excludes other borrows through this lease.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Takes a transport reference on the slot.
    pub(crate) fn hold(&self) -> Option<Hold> {
        let mut inner = self.pool.slots[self.slot as usize].lock();
        if inner.state != SlotState::Acquired {
            tracing::error!("hold on {} in state {:?}", self.key(), inner.state);
            return None;
        }
        inner.state = SlotState::Held;
        Some(Hold {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
            released: false,
        })
    }

    pub(crate) fn finish(mut self) -> Released {
        self.released = true;
        finish_lease(&self.pool, self.slot)
    }
}

fn finish_lease(pool: &SlotPool, slot: u32) -> Released {
    let mut inner = pool.slots[slot as usize].lock();
    match inner.state {
        SlotState::Acquired => {
            inner.state = SlotState::Free;
            inner.attrs = SlotAttrs::empty();
            drop(inner);
            pool.give_back(slot);
            Released::Returned
        }
        SlotState::Held => {
            inner.state = SlotState::HeldPendingReturn;
            Released::Deferred
        }
        state => {
            tracing::error!("lease of {} finished in state {:?}", pool.key(slot), state);
            Released::Deferred
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("lease of {} dropped without finish", self.key());
            finish_lease(&self.pool, self.slot);
        }
    }
}

/// Transport reference on a slot, travelling in the send context of a message.
pub struct Hold {
    pool: Arc<SlotPool>,
    slot: u32,
    released: bool,
}

impl fmt::Debug for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hold({})", self.key())
    }
}

impl Hold {
    #[inline]
    pub fn key(&self) -> SlotKey {
        self.pool.key(self.slot)
    }

    pub(crate) fn release(mut self) -> HoldReleased {
        self.released = true;
        release_hold(&self.pool, self.slot)
    }
}

fn release_hold(pool: &Arc<SlotPool>, slot: u32) -> HoldReleased {
    let mut inner = pool.slots[slot as usize].lock();
    match inner.state {
        SlotState::Held => {
            inner.state = SlotState::Acquired;
            HoldReleased::StillLeased
        }
        SlotState::HeldPendingReturn => {
            inner.state = SlotState::Free;
            inner.attrs = SlotAttrs::empty();
            drop(inner);
            pool.give_back(slot);
            HoldReleased::Returned
        }
        SlotState::HeldNeedStart => {
            inner.state = SlotState::Acquired;
            inner.attrs = SlotAttrs::empty();
            match inner.parked.take() {
                Some(request) => {
                    drop(inner);
                    HoldReleased::Restart(Lease::new(pool, slot), request)
                }
                None => {
                    inner.state = SlotState::Free;
                    drop(inner);
                    pool.give_back(slot);
                    HoldReleased::Returned
                }
            }
        }
        state => {
            tracing::error!("hold on {} released in state {:?}", pool.key(slot), state);
            HoldReleased::Returned
        }
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("hold on {} dropped without release", self.key());
            if let HoldReleased::Restart(lease, request) = release_hold(&self.pool, self.slot) {
                tracing::warn!("parked request {} discarded", request.float.origin);
                lease.finish();
            }
        }
    }
}

/// The send and receive pools of one node.
pub struct PoolSet {
    send: [Arc<SlotPool>; POOL_COUNT],
    receive: [Arc<SlotPool>; POOL_COUNT],
}

impl PoolSet {
    pub fn new(config: &PoolConfig) -> io::Result<Self> {
        let build = |kind: PoolKind| -> io::Result<[Arc<SlotPool>; POOL_COUNT]> {
            Ok([
                Arc::new(SlotPool::new(
                    PoolClass::Large,
                    kind,
                    config.large_slot_len,
                    config.large_slots,
                )?),
                Arc::new(SlotPool::new(
                    PoolClass::Small,
                    kind,
                    config.small_slot_len,
                    config.small_slots,
                )?),
            ])
        };
        Ok(PoolSet {
            send: build(PoolKind::Send)?,
            receive: build(PoolKind::Receive)?,
        })
    }

    #[inline]
    pub fn send(&self, class: PoolClass) -> &Arc<SlotPool> {
        &self.send[class.index()]
    }

    #[inline]
    pub fn receive(&self, class: PoolClass) -> &Arc<SlotPool> {
        &self.receive[class.index()]
    }

    /// Classes able to carry `len` bytes, smallest first. Empty if none can.
    pub fn classes_for(&self, len: usize) -> impl Iterator<Item = PoolClass> + '_ {
        [PoolClass::Small, PoolClass::Large]
            .into_iter()
            .filter(move |c| self.send(*c).slot_len() >= len)
    }

    #[inline]
    pub fn max_len(&self) -> usize {
        self.send(PoolClass::Large).slot_len()
    }

    pub fn is_idle(&self) -> bool {
        self.send.iter().chain(self.receive.iter()).all(|p| p.is_idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::message::{FloatHeader, PayloadFrame};
    use crate::io::operation::{ControlOperation, OpId, OperationHeader, OperationKind};

    fn pool(kind: PoolKind, count: u32) -> Arc<SlotPool> {
        Arc::new(SlotPool::new(PoolClass::Small, kind, 4096, count).unwrap())
    }

    fn request(slot: u32) -> RequestInfo {
        RequestInfo {
            float: FloatHeader {
                key: SlotKey::new(PoolClass::Small, slot),
                origin: OpId(1),
                address: 0,
                data_len: 0,
            },
            header: OperationHeader::default(),
            kind: OperationKind::Control(ControlOperation { opcode: 1 }),
            payload: PayloadFrame::None,
        }
    }

    #[test]
    fn slot_returns_after_both_tokens() {
        let pool = pool(PoolKind::Send, 1);
        let lease = pool.lock().acquire().unwrap();
        assert!(pool.lock().acquire().is_none());
        let hold = lease.hold().unwrap();
        assert!(lease.hold().is_none());
        assert_eq!(lease.finish(), Released::Deferred);
        assert_eq!(pool.state(0), Some(SlotState::HeldPendingReturn));
        assert!(!pool.is_idle());
        assert!(matches!(hold.release(), HoldReleased::Returned));
        assert!(pool.is_idle());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn hold_released_first_keeps_lease() {
        let pool = pool(PoolKind::Send, 2);
        let lease = pool.lock().acquire().unwrap();
        let hold = lease.hold().unwrap();
        assert!(matches!(hold.release(), HoldReleased::StillLeased));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(lease.finish(), Released::Returned);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn receive_slot_parks_behind_held_response() {
        let pool = pool(PoolKind::Receive, 2);
        let lease = match pool.acquire_at(1, request(1)) {
            Acquire::Ready(lease, _) => lease,
            _ => panic!("slot should be free"),
        };
        assert!(matches!(pool.acquire_at(1, request(1)), Acquire::Busy(_)));
        let hold = lease.hold().unwrap();
        lease.finish();
        assert!(matches!(pool.acquire_at(1, request(1)), Acquire::Parked));
        match hold.release() {
            HoldReleased::Restart(lease, parked) => {
                assert_eq!(parked.float.key.slot, 1);
                assert_eq!(lease.finish(), Released::Returned);
            }
            _ => panic!("parked request should restart"),
        }
        assert!(pool.is_idle());
        assert!(matches!(pool.acquire_at(9, request(9)), Acquire::Invalid(_)));
    }

    #[test]
    fn attributes_reset_on_reuse() {
        let pool = pool(PoolKind::Send, 1);
        let mut lease = pool.lock().acquire().unwrap();
        assert!(lease.test_and_set(SlotAttrs::ABORT_SENT));
        assert!(!lease.test_and_set(SlotAttrs::ABORT_SENT));
        lease.staging_mut(4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(lease.staging(4), &[1, 2, 3, 4]);
        lease.finish();
        let lease = pool.lock().acquire().unwrap();
        assert_eq!(lease.attrs(), SlotAttrs::empty());
        lease.finish();
    }

    #[test]
    fn dropped_tokens_still_return_the_slot() {
        let pool = pool(PoolKind::Send, 1);
        let lease = pool.lock().acquire().unwrap();
        let hold = lease.hold().unwrap();
        drop(lease);
        drop(hold);
        assert!(pool.is_idle());
    }

    #[test]
    fn classes_prefer_small() {
        let pools = PoolSet::new(&PoolConfig {
            large_slot_len: 8192,
            large_slots: 1,
            small_slot_len: 1024,
            small_slots: 1,
        })
        .unwrap();
        assert_eq!(
            pools.classes_for(100).collect::<Vec<_>>(),
            vec![PoolClass::Small, PoolClass::Large]
        );
        assert_eq!(pools.classes_for(2000).collect::<Vec<_>>(), vec![PoolClass::Large]);
        assert_eq!(pools.classes_for(9000).count(), 0);
    }
}
