//! Cancellation coordinator.
//!
//! A dedicated thread wakes on a coalescing signal, completes cancelled operations that
//! still wait for a slot, and asks the peer to abort cancelled operations that are
//! already outstanding, one abort message at a time.
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use super::message::IoMessage;
use super::slot::SlotAttrs;
use super::{EngineToken, IoEngine, StatusCode};
use crate::conduit::ClientId;
use crate::message as codec;

pub(crate) struct Coordinator {
    signal: Sender<()>,
    wake: Receiver<()>,
    stopped: Arc<AtomicBool>,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        let (signal, wake) = channel::bounded(1);
        Coordinator {
            signal,
            wake,
            stopped: Arc::new(AtomicBool::new(false)),
            handle: spin::Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, engine: Weak<IoEngine>) -> io::Result<()> {
        let wake = self.wake.clone();
        let stopped = Arc::clone(&self.stopped);
        let handle = thread::Builder::new()
            .name("cmi-cancel".to_owned())
            .spawn(move || {
                while wake.recv().is_ok() {
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    match engine.upgrade() {
                        Some(engine) => engine.cancel_scan(),
                        None => break,
                    }
                }
                tracing::debug!("cancel coordinator exits");
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Wakes the coordinator. Signals coalesce while one is pending.
    #[inline]
    pub(crate) fn notify(&self) {
        let _ = self.signal.try_send(());
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("cancel coordinator panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
    }
}

impl IoEngine {
    pub(crate) fn cancel_scan(&self) {
        let cancelled = {
            let mut waiting = self.waiting.lock();
            let mut keep = VecDeque::with_capacity(waiting.len());
            let mut cancelled = Vec::new();
            for entry in waiting.drain(..) {
                if entry.op.is_cancelled() {
                    cancelled.push(entry.op);
                } else {
                    keep.push_back(entry);
                }
            }
            *waiting = keep;
            cancelled
        };
        if !cancelled.is_empty() {
            tracing::debug!("{} waiting operations cancelled", cancelled.len());
            for op in cancelled {
                op.complete_with(StatusCode::Cancelled);
            }
            self.start_from_waiting();
        }
        self.send_next_abort();
    }

    fn send_next_abort(&self) {
        if !self.tables.peer_valid() {
            return;
        }
        if self
            .abort_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let target = self
            .outstanding
            .lock()
            .iter()
            .find(|(_, entry)| {
                entry.op.is_cancelled() && !entry.lease.attrs().contains(SlotAttrs::ABORT_SENT)
            })
            .map(|(key, entry)| {
                entry.lease.set_attrs(SlotAttrs::ABORT_SENT);
                (*key, entry.op.id(), entry.conduit)
            });
        let (key, origin, conduit) = match target {
            Some(target) => target,
            None => {
                self.abort_in_flight.store(false, Ordering::Release);
                return;
            }
        };
        match codec::encode(&IoMessage::PacketAbort { key, origin }) {
            Ok(bytes) => {
                tracing::debug!("asking the peer to abort {} in {}", origin, key);
                let _ = self.registry.send(
                    ClientId::SepIo,
                    conduit,
                    bytes,
                    Some(Box::new(EngineToken::Abort)),
                );
            }
            Err(e) => {
                tracing::error!("encode abort for {}: {}", origin, e);
                self.abort_in_flight.store(false, Ordering::Release);
            }
        }
    }
}
