//! The poll thread and the handle the service talks to.
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use cmi::transport::{
    EventSink, MessageContext, SendError, SendFailure, Transport, TransportEvent,
};
use cmi::{ClientId, ConduitId};

use super::config::TcpTransportConfig;
use super::ops::{encode_frame, AckStatus, Connection, Frame, HEADER_BYTES};
use super::state::{Pending, Shared};
use super::TransportError;

const LISTENER: Token = Token(0);
const PEER: Token = Token(1);
const WAKER: Token = Token(2);

const LISTEN_BACKLOG: i32 = 16;

enum Command {
    Frame { generation: u64, bytes: Vec<u8> },
    Stop,
}

/// Transport over a single TCP connection to the peer node.
pub struct TcpTransport {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    waker: Arc<Waker>,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
    max_frame_len: u64,
}

fn make_listener(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let listener = match config.listen {
            Some(addr) => {
                let mut listener = make_listener(addr)?;
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match listener.as_ref() {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let shared = Arc::new(Shared::default());
        let (tx, rx) = channel::unbounded();
        let max_frame_len = config.max_frame_len;
        let poller = Poller {
            poll,
            listener,
            conn: None,
            generation: 0,
            shared: Arc::clone(&shared),
            commands: rx,
            next_connect: Instant::now(),
            last_tx: Instant::now(),
            config,
        };
        let handle = thread::Builder::new()
            .name("cmi-tcp".to_string())
            .spawn(move || poller.run())?;

        if let Some(addr) = local_addr {
            tracing::info!("tcp transport listening on {}", addr);
        }
        Ok(Arc::new(TcpTransport {
            shared,
            commands: tx,
            waker,
            handle: spin::Mutex::new(Some(handle)),
            local_addr,
            max_frame_len,
        }))
    }

    /// Bound address when accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Stops the poll thread. The link is reported lost if it was up.
    pub fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.commands.send(Command::Stop);
            if let Err(e) = self.waker.wake() {
                tracing::warn!("tcp transport: wake failed: {}", e);
            }
            // the last handle may go away inside an event callback
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("tcp transport: poll thread panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for TcpTransport {
    fn open_conduit(&self, conduit: ConduitId) -> Result<(), SendError> {
        self.shared.opened.lock().insert(conduit);
        Ok(())
    }

    fn send(
        &self,
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
        context: Option<MessageContext>,
    ) -> Result<(), SendFailure> {
        let fail = |error, context| Err(SendFailure { error, context });
        if !self.shared.opened.lock().contains(&conduit) {
            return fail(
                SendError::GenericFailure(format!("conduit {} not open", conduit)),
                context,
            );
        }
        let seq = self.shared.next_seq();
        let bytes = match encode_frame(&Frame::Data {
            seq,
            conduit,
            client,
            payload,
        }) {
            Ok(bytes) => bytes,
            Err(e) => return fail(SendError::GenericFailure(e.to_string()), context),
        };
        if (bytes.len() - HEADER_BYTES) as u64 > self.max_frame_len {
            return fail(
                SendError::GenericFailure(format!("frame of {} bytes too large", bytes.len())),
                context,
            );
        }

        let generation = {
            let mut link = self.shared.link.lock();
            if !link.connected {
                drop(link);
                return fail(SendError::NoDevice, context);
            }
            link.pending.insert(
                seq,
                Pending {
                    conduit,
                    client,
                    context,
                },
            );
            link.generation
        };

        if self
            .commands
            .send(Command::Frame { generation, bytes })
            .is_err()
        {
            let context = self.shared.take_pending(seq).and_then(|p| p.context);
            return fail(SendError::NoDevice, context);
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!("tcp transport: wake failed: {}", e);
        }
        Ok(())
    }

    fn attach(&self, sink: Weak<dyn EventSink>) {
        self.shared.attach(sink);
    }

    fn detach(&self) {
        self.shared.detach();
    }
}

struct Poller {
    poll: Poll,
    listener: Option<TcpListener>,
    conn: Option<Connection>,
    generation: u64,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    next_connect: Instant,
    last_tx: Instant,
    config: TcpTransportConfig,
}

impl Poller {
    fn run(mut self) {
        if let Err(e) = self.mainloop() {
            tracing::error!("tcp transport: poll loop failed: {}", e);
        }
        self.drop_connection("transport stopped");
    }

    fn mainloop(&mut self) -> Result<(), TransportError> {
        let mut events = Events::with_capacity(64);
        loop {
            self.maintain()?;
            match self.poll.poll(&mut events, Some(self.config.poll_timeout())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    PEER => self.on_peer_event(event),
                    _ => {}
                }
            }
            if !self.drain_commands() {
                return Ok(());
            }
            self.flush();
        }
    }

    fn accept(&mut self) -> Result<(), TransportError> {
        loop {
            let accepted = match self.listener.as_mut() {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            let (sock, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            tracing::info!("tcp transport: accepted peer {}", addr);
            // a new connection means the peer gave up on the old one
            self.drop_connection("peer reconnected");
            self.install(sock, true)?;
        }
    }

    fn install(&mut self, mut sock: TcpStream, established: bool) -> Result<(), TransportError> {
        sock.set_nodelay(true)?;
        self.poll
            .registry()
            .register(&mut sock, PEER, Interest::READABLE | Interest::WRITABLE)?;
        self.conn = Some(Connection::new(
            sock,
            self.config.max_frame_len,
            established,
        ));
        if established {
            self.on_established();
        }
        Ok(())
    }

    fn on_established(&mut self) {
        self.generation = self.shared.connect();
        self.last_tx = Instant::now();
        tracing::info!("tcp transport: link up, generation {}", self.generation);
    }

    fn drop_connection(&mut self, reason: &str) {
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!("tcp transport: dropping connection: {}", reason);
            if let Err(e) = self.poll.registry().deregister(conn.sock_mut()) {
                tracing::debug!("tcp transport: deregister failed: {}", e);
            }
        }
        self.generation = 0;
        self.next_connect = Instant::now() + self.config.connect_retry();
        self.shared.disconnect();
    }

    /// Connect retries, heartbeats and peer silence.
    fn maintain(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();
        let state = self
            .conn
            .as_ref()
            .map(|conn| (conn.is_established(), conn.last_rx()));
        match state {
            None => {
                let peer = match self.config.peer {
                    Some(peer) if now >= self.next_connect => peer,
                    _ => return Ok(()),
                };
                match TcpStream::connect(peer) {
                    Ok(sock) => self.install(sock, false)?,
                    Err(e) => {
                        tracing::debug!("tcp transport: connect to {} failed: {}", peer, e);
                        self.next_connect = now + self.config.connect_retry();
                    }
                }
            }
            Some((true, last_rx)) => {
                if now.duration_since(last_rx) > self.config.peer_timeout() {
                    self.drop_connection("peer silent");
                } else if now.duration_since(self.last_tx) >= self.config.heartbeat() {
                    self.queue(&Frame::Heartbeat);
                    self.flush();
                }
            }
            Some((false, started)) => {
                if now.duration_since(started) > self.config.peer_timeout() {
                    self.abandon_connect("timed out");
                }
            }
        }
        Ok(())
    }

    fn abandon_connect(&mut self, reason: &str) {
        tracing::debug!("tcp transport: connect to {:?} failed: {}", self.config.peer, reason);
        if let Some(mut conn) = self.conn.take() {
            let _ = self.poll.registry().deregister(conn.sock_mut());
        }
        self.next_connect = Instant::now() + self.config.connect_retry();
    }

    fn on_peer_event(&mut self, event: &Event) {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return,
        };
        if !conn.is_established() {
            match conn.finish_connect() {
                Ok(true) => {
                    tracing::info!("tcp transport: connected to {:?}", self.config.peer);
                    self.on_established();
                }
                Ok(false) => return,
                Err(e) => {
                    self.abandon_connect(&e.to_string());
                    return;
                }
            }
        }

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            let mut frames = Vec::new();
            let res = match self.conn.as_mut() {
                Some(conn) => conn.check_read(&mut frames),
                None => return,
            };
            // deliver what arrived before the failure
            for frame in frames {
                self.on_frame(frame);
            }
            if let Err(e) = res {
                self.drop_connection(&e.to_string());
                return;
            }
        }
        if event.is_writable() {
            self.flush();
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Data {
                seq,
                conduit,
                client,
                payload,
            } => {
                let status = match self.shared.sink() {
                    Some(sink) => {
                        sink.on_event(TransportEvent::Received {
                            conduit,
                            client,
                            payload,
                        });
                        AckStatus::Delivered
                    }
                    None => AckStatus::NotPresent,
                };
                self.queue(&Frame::Ack { seq, status });
            }
            Frame::Ack { seq, status } => {
                let pending = match self.shared.take_pending(seq) {
                    Some(p) => p,
                    None => {
                        tracing::debug!("tcp transport: stray ack {}", seq);
                        return;
                    }
                };
                let event = match status {
                    AckStatus::Delivered => TransportEvent::Transmitted {
                        conduit: pending.conduit,
                        client: pending.client,
                        context: pending.context,
                    },
                    AckStatus::NotPresent => TransportEvent::PeerNotPresent {
                        conduit: pending.conduit,
                        client: pending.client,
                        context: pending.context,
                    },
                };
                self.shared.emit(event);
            }
            Frame::Heartbeat => {}
        }
    }

    fn queue(&mut self, frame: &Frame) {
        let conn = match self.conn.as_mut() {
            Some(conn) if conn.is_established() => conn,
            _ => return,
        };
        match encode_frame(frame) {
            Ok(bytes) => {
                conn.queue(bytes);
                self.last_tx = Instant::now();
            }
            Err(e) => tracing::error!("tcp transport: cannot encode {:?}: {}", frame, e),
        }
    }

    /// Returns false once asked to stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Frame { generation, bytes }) => match self.conn.as_mut() {
                    Some(conn) if conn.is_established() && generation == self.generation => {
                        conn.queue(bytes);
                        self.last_tx = Instant::now();
                    }
                    // the sends of a lost connection were already failed
                    _ => tracing::trace!("tcp transport: dropping frame of generation {}", generation),
                },
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn flush(&mut self) {
        let res = match self.conn.as_mut() {
            Some(conn) if conn.is_established() && conn.has_pending_writes() => conn.check_write(),
            _ => return,
        };
        if let Err(e) = res {
            self.drop_connection(&e.to_string());
        }
    }
}
