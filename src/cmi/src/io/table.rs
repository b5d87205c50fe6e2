//! Translation tables: where each side's staging areas live.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::slot::{PoolClass, PoolSet, SlotKey, POOL_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationTable {
    pub incarnation: u64,
    pub epoch: u64,
    pub send: [u64; POOL_COUNT],
    pub receive: [u64; POOL_COUNT],
    pub slot_len: [u32; POOL_COUNT],
    pub slots: [u32; POOL_COUNT],
}

impl TranslationTable {
    /// Address of `key` in the receive area described by this table.
    #[inline]
    pub fn receive_addr(&self, key: SlotKey) -> u64 {
        let pool = key.pool.index();
        self.receive[pool] + key.slot as u64 * self.slot_len[pool] as u64
    }

    /// Address of `key` in the send area described by this table.
    #[inline]
    pub fn send_addr(&self, key: SlotKey) -> u64 {
        let pool = key.pool.index();
        self.send[pool] + key.slot as u64 * self.slot_len[pool] as u64
    }

    pub fn same_geometry(&self, other: &TranslationTable) -> bool {
        self.slot_len == other.slot_len && self.slots == other.slots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accept {
    Stored,
    /// Older epoch of the incarnation we already know.
    Stale,
    GeometryMismatch,
}

pub(crate) struct Tables {
    incarnation: u64,
    epoch: AtomicU64,
    local: spin::RwLock<Option<TranslationTable>>,
    peer: spin::RwLock<Option<TranslationTable>>,
    exchange: spin::Mutex<Exchange>,
}

#[derive(Debug, Default)]
struct Exchange {
    in_flight: bool,
    /// The peer asked for our table while an exchange was in flight.
    reply_owed: bool,
}

impl Tables {
    pub(crate) fn new(incarnation: u64) -> Self {
        Tables {
            incarnation,
            epoch: AtomicU64::new(0),
            local: spin::RwLock::new(None),
            peer: spin::RwLock::new(None),
            exchange: spin::Mutex::new(Exchange::default()),
        }
    }

    pub(crate) fn publish_local(&self, pools: &PoolSet) -> TranslationTable {
        let mut table = TranslationTable {
            incarnation: self.incarnation,
            epoch: self.epoch.fetch_add(1, Ordering::AcqRel) + 1,
            send: [0; POOL_COUNT],
            receive: [0; POOL_COUNT],
            slot_len: [0; POOL_COUNT],
            slots: [0; POOL_COUNT],
        };
        for class in PoolClass::ALL {
            let i = class.index();
            table.send[i] = pools.send(class).base_addr();
            table.receive[i] = pools.receive(class).base_addr();
            table.slot_len[i] = pools.send(class).slot_len() as u32;
            table.slots[i] = pools.send(class).slot_count();
        }
        *self.local.write() = Some(table);
        table
    }

    #[inline]
    pub(crate) fn local(&self) -> Option<TranslationTable> {
        *self.local.read()
    }

    #[inline]
    pub(crate) fn local_valid(&self) -> bool {
        self.local.read().is_some()
    }

    pub(crate) fn invalidate_local(&self) {
        self.local.write().take();
    }

    #[inline]
    pub(crate) fn peer(&self) -> Option<TranslationTable> {
        *self.peer.read()
    }

    #[inline]
    pub(crate) fn peer_valid(&self) -> bool {
        self.peer.read().is_some()
    }

    pub(crate) fn invalidate_peer(&self) {
        self.peer.write().take();
    }

    pub(crate) fn accept_peer(&self, table: TranslationTable) -> Accept {
        if let Some(local) = self.local() {
            if !local.same_geometry(&table) {
                return Accept::GeometryMismatch;
            }
        }
        let mut peer = self.peer.write();
        if let Some(known) = peer.as_ref() {
            if known.incarnation == table.incarnation && table.epoch < known.epoch {
                return Accept::Stale;
            }
        }
        *peer = Some(table);
        Accept::Stored
    }

    /// Claims the single exchange slot. Returns false if an exchange is in flight.
    pub(crate) fn try_begin_exchange(&self) -> bool {
        let mut exchange = self.exchange.lock();
        if exchange.in_flight {
            return false;
        }
        exchange.in_flight = true;
        true
    }

    /// Claims the exchange slot for a reply, or owes the reply to the running exchange.
    pub(crate) fn begin_reply(&self) -> bool {
        let mut exchange = self.exchange.lock();
        if exchange.in_flight {
            exchange.reply_owed = true;
            return false;
        }
        exchange.in_flight = true;
        true
    }

    /// Releases the exchange slot. Returns true if a reply is owed; the slot is then
    /// kept for it.
    pub(crate) fn end_exchange(&self) -> bool {
        let mut exchange = self.exchange.lock();
        if exchange.reply_owed {
            exchange.reply_owed = false;
            return true;
        }
        exchange.in_flight = false;
        false
    }

    pub(crate) fn reset_exchange(&self) {
        *self.exchange.lock() = Exchange::default();
    }

    #[inline]
    pub(crate) fn exchange_in_flight(&self) -> bool {
        self.exchange.lock().in_flight
    }
}
