use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fnv::{FnvHashMap, FnvHashSet};

use cmi::transport::{EventSink, MessageContext, TransportEvent};
use cmi::{ClientId, ConduitId};

/// A send waiting for the peer's acknowledgement.
pub(crate) struct Pending {
    pub(crate) conduit: ConduitId,
    pub(crate) client: ClientId,
    pub(crate) context: Option<MessageContext>,
}

#[derive(Default)]
pub(crate) struct Link {
    pub(crate) connected: bool,
    /// Bumped on every new connection; frames queued for an older one are dropped.
    pub(crate) generation: u64,
    pub(crate) pending: FnvHashMap<u64, Pending>,
}

/// State shared by the caller-facing handle and the poll thread.
#[derive(Default)]
pub(crate) struct Shared {
    sink: spin::RwLock<Option<Weak<dyn EventSink>>>,
    pub(crate) opened: spin::Mutex<FnvHashSet<ConduitId>>,
    seq: AtomicU64,
    pub(crate) link: spin::Mutex<Link>,
}

impl Shared {
    pub(crate) fn attach(&self, sink: Weak<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    pub(crate) fn detach(&self) {
        self.sink.write().take();
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        match self.sink() {
            Some(sink) => sink.on_event(event),
            None => tracing::trace!("tcp transport: no sink for {:?}", event),
        }
    }

    #[inline]
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    /// Marks the link up and returns the generation of the new connection.
    pub(crate) fn connect(&self) -> u64 {
        let mut link = self.link.lock();
        link.connected = true;
        link.generation += 1;
        link.generation
    }

    /// Marks the link down. Reports contact loss and fails every unacknowledged send,
    /// once per connection.
    pub(crate) fn disconnect(&self) {
        let pending = {
            let mut link = self.link.lock();
            if !link.connected {
                return;
            }
            link.connected = false;
            std::mem::take(&mut link.pending)
        };
        let mut pending: Vec<_> = pending.into_iter().collect();
        pending.sort_unstable_by_key(|(seq, _)| *seq);
        tracing::warn!(
            "tcp transport: contact lost, failing {} unacknowledged sends",
            pending.len()
        );
        self.emit(TransportEvent::ContactLost);
        for (_, p) in pending {
            self.emit(TransportEvent::PeerNotPresent {
                conduit: p.conduit,
                client: p.client,
                context: p.context,
            });
        }
    }

    pub(crate) fn take_pending(&self, seq: u64) -> Option<Pending> {
        self.link.lock().pending.remove(&seq)
    }
}
