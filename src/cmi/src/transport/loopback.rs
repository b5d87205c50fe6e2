//! In-process transport joining two nodes.
//!
//! Each direction is served by one delivery thread, so frames arrive in send order. The
//! receiving side gets `Received` before the sender gets `Transmitted`; tests can hold
//! the acknowledgements back, inject faults, and cut the link.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use fnv::{FnvHashMap, FnvHashSet};

use super::{EventSink, MessageContext, SendError, SendFailure, Transport, TransportEvent};
use crate::conduit::{ClientId, ConduitId};

/// Outcome forced on the next send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Refuse synchronously.
    Refuse(SendError),
    PeerBusy,
    PeerNotPresent,
    FatalError,
}

impl Fault {
    fn into_event(
        self,
        conduit: ConduitId,
        client: ClientId,
        context: Option<MessageContext>,
    ) -> TransportEvent {
        match self {
            Fault::PeerBusy => TransportEvent::PeerBusy {
                conduit,
                client,
                context,
            },
            Fault::FatalError => TransportEvent::FatalError {
                conduit,
                client,
                context,
            },
            Fault::PeerNotPresent | Fault::Refuse(_) => TransportEvent::PeerNotPresent {
                conduit,
                client,
                context,
            },
        }
    }
}

enum Frame {
    Data {
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
        fault: Option<Fault>,
    },
    Barrier(Sender<()>),
}

struct Ack {
    conduit: ConduitId,
    client: ClientId,
    context: Option<MessageContext>,
}

#[derive(Default)]
struct Endpoint {
    sink: spin::RwLock<Option<Weak<dyn EventSink>>>,
    opened: spin::Mutex<FnvHashSet<ConduitId>>,
    hold_acks: AtomicBool,
    held_acks: spin::Mutex<Vec<Ack>>,
    faults: spin::Mutex<VecDeque<Fault>>,
    sent: spin::Mutex<FnvHashMap<(ConduitId, ClientId), u64>>,
}

impl Endpoint {
    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: TransportEvent) {
        match self.sink() {
            Some(sink) => sink.on_event(event),
            None => tracing::trace!("loopback: no sink for {:?}", event),
        }
    }
}

struct Link {
    connected: AtomicBool,
}

pub struct LoopbackTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    link: Arc<Link>,
    frames: Sender<Frame>,
}

impl LoopbackTransport {
    /// Two connected ends.
    pub fn pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let link = Arc::new(Link {
            connected: AtomicBool::new(true),
        });
        let left = Arc::new(Endpoint::default());
        let right = Arc::new(Endpoint::default());
        let (left_tx, left_rx) = channel::unbounded();
        let (right_tx, right_rx) = channel::unbounded();

        spawn_delivery("loopback-l2r", left_rx, &left, &right, &link);
        spawn_delivery("loopback-r2l", right_rx, &right, &left, &link);

        let l = LoopbackTransport {
            local: Arc::clone(&left),
            remote: Arc::clone(&right),
            link: Arc::clone(&link),
            frames: left_tx,
        };
        let r = LoopbackTransport {
            local: right,
            remote: left,
            link,
            frames: right_tx,
        };
        (Arc::new(l), Arc::new(r))
    }

    /// Cuts the link and reports `ContactLost` to both ends.
    pub fn disconnect(&self) {
        if self.link.connected.swap(false, Ordering::AcqRel) {
            self.local.emit(TransportEvent::ContactLost);
            self.remote.emit(TransportEvent::ContactLost);
        }
    }

    pub fn reconnect(&self) {
        self.link.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    /// While set, `Transmitted` events of this end are kept until [`release_held_acks`].
    ///
    /// [`release_held_acks`]: LoopbackTransport::release_held_acks
    pub fn set_hold_acks(&self, hold: bool) {
        self.local.hold_acks.store(hold, Ordering::Release);
    }

    pub fn release_held_acks(&self) -> usize {
        let acks: Vec<Ack> = std::mem::take(&mut *self.local.held_acks.lock());
        let n = acks.len();
        for ack in acks {
            self.local.emit(TransportEvent::Transmitted {
                conduit: ack.conduit,
                client: ack.client,
                context: ack.context,
            });
        }
        n
    }

    /// Ends the held sends with `fault` instead of `Transmitted`.
    pub fn fail_held_acks(&self, fault: Fault) -> usize {
        let acks: Vec<Ack> = std::mem::take(&mut *self.local.held_acks.lock());
        let n = acks.len();
        for ack in acks {
            self.local
                .emit(fault.clone().into_event(ack.conduit, ack.client, ack.context));
        }
        n
    }

    pub fn held_acks(&self) -> usize {
        self.local.held_acks.lock().len()
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.local.faults.lock().push_back(fault);
    }

    /// Number of frames accepted for `(conduit, client)`.
    pub fn sent_frames(&self, conduit: ConduitId, client: ClientId) -> u64 {
        self.local
            .sent
            .lock()
            .get(&(conduit, client))
            .copied()
            .unwrap_or(0)
    }

    /// Waits until every frame sent so far from this end has been delivered.
    pub fn flush(&self) {
        let (tx, rx) = channel::bounded(1);
        if self.frames.send(Frame::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

fn spawn_delivery(
    name: &str,
    frames: Receiver<Frame>,
    src: &Arc<Endpoint>,
    dst: &Arc<Endpoint>,
    link: &Arc<Link>,
) {
    let src = Arc::clone(src);
    let dst = Arc::clone(dst);
    let link = Arc::clone(link);
    let spawned = thread::Builder::new().name(name.to_owned()).spawn(move || {
        for frame in frames.iter() {
            match frame {
                Frame::Data {
                    conduit,
                    client,
                    payload,
                    context,
                    fault,
                } => deliver(&src, &dst, &link, conduit, client, payload, context, fault),
                Frame::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    if let Err(e) = spawned {
        tracing::error!("loopback: failed to spawn delivery thread: {}", e);
    }
}

#[allow(clippy::too_many_arguments)]
fn deliver(
    src: &Endpoint,
    dst: &Endpoint,
    link: &Link,
    conduit: ConduitId,
    client: ClientId,
    payload: Vec<u8>,
    context: Option<MessageContext>,
    fault: Option<Fault>,
) {
    let event = match fault {
        Some(fault) => Some(fault.into_event(conduit, client, context)),
        None if !link.connected.load(Ordering::Acquire) || dst.sink().is_none() => {
            Some(TransportEvent::PeerNotPresent {
                conduit,
                client,
                context,
            })
        }
        None => {
            dst.emit(TransportEvent::Received {
                conduit,
                client,
                payload,
            });
            if src.hold_acks.load(Ordering::Acquire) {
                src.held_acks.lock().push(Ack {
                    conduit,
                    client,
                    context,
                });
                None
            } else {
                Some(TransportEvent::Transmitted {
                    conduit,
                    client,
                    context,
                })
            }
        }
    };
    if let Some(event) = event {
        src.emit(event);
    }
}

impl Transport for LoopbackTransport {
    fn open_conduit(&self, conduit: ConduitId) -> Result<(), SendError> {
        self.local.opened.lock().insert(conduit);
        Ok(())
    }

    fn send(
        &self,
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
    ) -> Result<(), SendFailure> {
        if !self.local.opened.lock().contains(&conduit) {
            return Err(SendFailure {
                error: SendError::GenericFailure(format!("conduit {} is not open", conduit)),
                context,
            });
        }
        if !self.link.connected.load(Ordering::Acquire) {
            return Err(SendFailure {
                error: SendError::NoDevice,
                context,
            });
        }
        let fault = self.local.faults.lock().pop_front();
        if let Some(Fault::Refuse(error)) = fault {
            return Err(SendFailure { error, context });
        }
        *self.local.sent.lock().entry((conduit, client)).or_insert(0) += 1;
        let frame = Frame::Data {
            conduit,
            client,
            payload,
            context,
            fault,
        };
        self.frames.send(frame).map_err(|e| {
            let context = match e.into_inner() {
                Frame::Data { context, .. } => context,
                Frame::Barrier(_) => None,
            };
            SendFailure {
                error: SendError::GenericFailure("loopback delivery thread is gone".into()),
                context,
            }
        })
    }

    fn attach(&self, sink: Weak<dyn EventSink>) {
        *self.local.sink.write() = Some(sink);
    }

    fn detach(&self) {
        *self.local.sink.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EventSink for Recorder {
        fn on_event(&self, event: TransportEvent) {
            self.events.lock().unwrap().push(format!("{:?}", event));
        }
    }

    fn attached() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>, Arc<Recorder>, Arc<Recorder>) {
        let (l, r) = LoopbackTransport::pair();
        let (rl, rr) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        let wl: Weak<dyn EventSink> = Arc::downgrade(&rl) as Weak<dyn EventSink>;
        let wr: Weak<dyn EventSink> = Arc::downgrade(&rr) as Weak<dyn EventSink>;
        l.attach(wl);
        r.attach(wr);
        l.open_conduit(ConduitId::Service).unwrap();
        r.open_conduit(ConduitId::Service).unwrap();
        (l, r, rl, rr)
    }

    #[test]
    fn delivers_then_acknowledges() {
        let (l, _r, rl, rr) = attached();
        l.send(ConduitId::Service, ClientId::Service, vec![1, 2, 3], None)
            .unwrap();
        l.flush();
        assert_eq!(rr.events.lock().unwrap().len(), 1);
        assert!(rr.events.lock().unwrap()[0].starts_with("Received"));
        assert!(rl.events.lock().unwrap()[0].starts_with("Transmitted"));
        assert_eq!(l.sent_frames(ConduitId::Service, ClientId::Service), 1);
    }

    #[test]
    fn unopened_conduit_is_refused() {
        let (l, _r, _rl, _rr) = attached();
        let err = l
            .send(ConduitId::Job, ClientId::Job, vec![], None)
            .unwrap_err();
        assert!(matches!(err.error, SendError::GenericFailure(_)));
    }

    #[test]
    fn missing_peer_sink_is_not_present() {
        let (l, r, rl, _rr) = attached();
        r.detach();
        l.send(ConduitId::Service, ClientId::Service, vec![0], None)
            .unwrap();
        l.flush();
        assert!(rl.events.lock().unwrap()[0].starts_with("PeerNotPresent"));
    }

    #[test]
    fn held_acks_are_released_on_demand() {
        let (l, _r, rl, _rr) = attached();
        l.set_hold_acks(true);
        l.send(ConduitId::Service, ClientId::Service, vec![0], None)
            .unwrap();
        l.flush();
        assert!(rl.events.lock().unwrap().is_empty());
        assert_eq!(l.release_held_acks(), 1);
        assert_eq!(rl.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn disconnect_reports_contact_lost_once() {
        let (l, r, rl, rr) = attached();
        l.disconnect();
        r.disconnect();
        assert_eq!(*rl.events.lock().unwrap(), vec!["ContactLost".to_owned()]);
        assert_eq!(*rr.events.lock().unwrap(), vec!["ContactLost".to_owned()]);
        let err = l
            .send(ConduitId::Service, ClientId::Service, vec![], None)
            .unwrap_err();
        assert_eq!(err.error, SendError::NoDevice);
    }

    #[test]
    fn faults_apply_to_next_send() {
        let (l, _r, rl, _rr) = attached();
        l.inject_fault(Fault::PeerBusy);
        l.send(ConduitId::Service, ClientId::Service, vec![], None)
            .unwrap();
        l.flush();
        assert!(rl.events.lock().unwrap()[0].starts_with("PeerBusy"));
    }
}
