//! Per-conduit counters of the forwarding engine.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::conduit::ConduitId;
use crate::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConduitStatistics {
    pub sent_ops: u64,
    pub sent_bytes: u64,
    pub received_ops: u64,
    pub received_bytes: u64,
    pub sent_errors: u64,
    pub received_errors: u64,
}

#[derive(Default)]
struct Counters {
    sent_ops: AtomicU64,
    sent_bytes: AtomicU64,
    received_ops: AtomicU64,
    received_bytes: AtomicU64,
    sent_errors: AtomicU64,
    received_errors: AtomicU64,
}

impl Counters {
    fn load(&self) -> ConduitStatistics {
        ConduitStatistics {
            sent_ops: self.sent_ops.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_ops: self.received_ops.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_errors: self.sent_errors.load(Ordering::Relaxed),
            received_errors: self.received_errors.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        for c in [
            &self.sent_ops,
            &self.sent_bytes,
            &self.received_ops,
            &self.received_bytes,
            &self.sent_errors,
            &self.received_errors,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

pub struct Statistics {
    conduits: Box<[Counters]>,
}

impl Statistics {
    pub fn new(io_conduits: u16) -> Self {
        Statistics {
            conduits: (0..io_conduits).map(|_| Counters::default()).collect(),
        }
    }

    fn counters(&self, conduit: ConduitId) -> Result<&Counters, Error> {
        match conduit {
            ConduitId::SepIo(n) => self
                .conduits
                .get(n as usize)
                .ok_or(Error::InvalidConduit(conduit)),
            _ => Err(Error::InvalidConduit(conduit)),
        }
    }

    pub fn get(&self, conduit: ConduitId) -> Result<ConduitStatistics, Error> {
        self.counters(conduit).map(Counters::load)
    }

    pub fn clear(&self, conduit: ConduitId) -> Result<(), Error> {
        self.counters(conduit).map(Counters::clear)
    }

    pub fn snapshot(&self) -> Vec<(ConduitId, ConduitStatistics)> {
        self.conduits
            .iter()
            .enumerate()
            .map(|(n, c)| (ConduitId::SepIo(n as u16), c.load()))
            .collect()
    }

    pub(crate) fn record_sent(&self, conduit: ConduitId, bytes: usize) {
        if let Ok(c) = self.counters(conduit) {
            c.sent_ops.fetch_add(1, Ordering::Relaxed);
            c.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_received(&self, conduit: ConduitId, bytes: usize) {
        if let Ok(c) = self.counters(conduit) {
            c.received_ops.fetch_add(1, Ordering::Relaxed);
            c.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_send_error(&self, conduit: ConduitId) {
        if let Ok(c) = self.counters(conduit) {
            c.sent_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_receive_error(&self, conduit: ConduitId) {
        if let Ok(c) = self.counters(conduit) {
            c.received_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
