use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cmi::config::{CmiConfig, PoolConfig};
use cmi::io::{
    ControlStatus, IoConsumer, OpStatus, Operation, OperationKind, SgList, StatusCode,
    StatusDetail,
};
use cmi::transport::{EventSink, SendError, Transport, TransportEvent};
use cmi::{ClientId, CmiService, ConduitId, Role, SpId};
use cmi_transport_tcp::{TcpTransport, TcpTransportConfig};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn fast(config: &mut TcpTransportConfig) {
    config.connect_retry_ms = 20;
    config.poll_timeout_ms = 5;
    config.heartbeat_ms = 50;
    config.peer_timeout_ms = 500;
}

/// A listening and a connecting transport joined over localhost.
fn link() -> (Arc<TcpTransport>, Arc<TcpTransport>) {
    init_logging();
    let mut config = TcpTransportConfig {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    };
    fast(&mut config);
    let server = TcpTransport::new(config).unwrap();

    let mut config = TcpTransportConfig {
        peer: server.local_addr(),
        ..Default::default()
    };
    fast(&mut config);
    let client = TcpTransport::new(config).unwrap();

    assert!(client.wait_connected(WAIT));
    assert!(server.wait_connected(WAIT));
    (server, client)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    payloads: Mutex<Vec<Vec<u8>>>,
    contexts: Mutex<Vec<u32>>,
}

impl Recorder {
    fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl EventSink for Recorder {
    fn on_event(&self, event: TransportEvent) {
        self.events.lock().unwrap().push(format!("{:?}", event));
        match event {
            TransportEvent::Received { payload, .. } => {
                self.payloads.lock().unwrap().push(payload)
            }
            TransportEvent::Transmitted { context, .. }
            | TransportEvent::PeerNotPresent { context, .. } => {
                if let Some(ctx) = context.and_then(|c| c.downcast::<u32>().ok()) {
                    self.contexts.lock().unwrap().push(*ctx);
                }
            }
            _ => {}
        }
    }
}

fn attach(transport: &TcpTransport) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder::default());
    let sink: Arc<dyn EventSink> = recorder.clone();
    transport.attach(Arc::downgrade(&sink));
    recorder
}

#[test]
fn frames_are_delivered_and_acknowledged() {
    let (server, client) = link();
    let (rs, rc) = (attach(&server), attach(&client));
    client.open_conduit(ConduitId::Job).unwrap();

    for i in 0..10u32 {
        client
            .send(
                ConduitId::Job,
                ClientId::Job,
                vec![i as u8; 100 * i as usize],
                Some(Box::new(i)),
            )
            .unwrap();
    }
    assert!(wait_until(WAIT, || rc.count("Transmitted(Job, Job)") == 10));
    assert_eq!(*rc.contexts.lock().unwrap(), (0..10).collect::<Vec<_>>());

    let payloads = rs.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 10);
    assert_eq!(payloads[3], vec![3u8; 300]);
}

#[test]
fn large_frames_cross_in_pieces() {
    let (server, client) = link();
    let (rs, rc) = (attach(&server), attach(&client));
    server.open_conduit(ConduitId::SepIo(0)).unwrap();

    let data: Vec<u8> = (0..2 << 20).map(|i| (i % 251) as u8).collect();
    server
        .send(ConduitId::SepIo(0), ClientId::SepIo, data.clone(), None)
        .unwrap();
    assert!(wait_until(WAIT, || rs.count("Transmitted") == 1));
    assert_eq!(rc.payloads.lock().unwrap()[0], data);
}

#[test]
fn sends_are_refused_synchronously() {
    init_logging();
    let mut config = TcpTransportConfig {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    };
    fast(&mut config);
    let lone = TcpTransport::new(config).unwrap();

    let err = lone
        .send(ConduitId::Job, ClientId::Job, vec![1], Some(Box::new(1u32)))
        .unwrap_err();
    assert!(matches!(err.error, SendError::GenericFailure(_)));
    assert!(err.context.is_some());

    lone.open_conduit(ConduitId::Job).unwrap();
    let err = lone.send(ConduitId::Job, ClientId::Job, vec![1], None).unwrap_err();
    assert_eq!(err.error, SendError::NoDevice);
}

#[test]
fn unattached_peer_is_not_present() {
    let (server, client) = link();
    let rc = attach(&client);
    client.open_conduit(ConduitId::Service).unwrap();
    client
        .send(ConduitId::Service, ClientId::Service, vec![9], Some(Box::new(5u32)))
        .unwrap();
    assert!(wait_until(WAIT, || rc.count("PeerNotPresent") == 1));
    assert_eq!(*rc.contexts.lock().unwrap(), vec![5]);
    drop(server);
}

#[test]
fn peer_shutdown_is_contact_loss_and_the_link_comes_back() {
    let (server, client) = link();
    let rs = attach(&server);
    let rc = attach(&client);

    client.shutdown();
    assert!(wait_until(WAIT, || rs.count("ContactLost") == 1));
    assert!(!server.is_connected());
    assert_eq!(rc.count("ContactLost"), 1);

    // a new connector on the same listener
    let mut config = TcpTransportConfig {
        peer: server.local_addr(),
        ..Default::default()
    };
    fast(&mut config);
    let again = TcpTransport::new(config).unwrap();
    assert!(again.wait_connected(WAIT));
    assert!(server.wait_connected(WAIT));
}

#[test]
fn heartbeats_keep_an_idle_link_up() {
    let (server, client) = link();
    let rs = attach(&server);
    thread::sleep(Duration::from_millis(1_200));
    assert!(server.is_connected() && client.is_connected());
    assert_eq!(rs.count("ContactLost"), 0);
}

/// Answers control operations with their payload reversed.
struct Mirror;

impl IoConsumer for Mirror {
    fn submit(&self, mut op: Operation) {
        let opcode = match op.kind() {
            OperationKind::Control(control) => Some(control.opcode),
            _ => None,
        };
        let opcode = match opcode {
            Some(opcode) => opcode,
            None => return op.complete_with(StatusCode::Failed),
        };
        let mut data = op.payload().gather();
        data.reverse();
        op.payload_mut().scatter(&data);
        op.complete(
            OpStatus::ok(),
            StatusDetail::Control(ControlStatus {
                status: opcode,
                qualifier: data.len() as u32,
            }),
        );
    }
}

fn service_config(sp: SpId) -> CmiConfig {
    let mut config = CmiConfig {
        sp,
        io_conduits: 1,
        pools: PoolConfig {
            large_slot_len: 64 * 1024,
            large_slots: 2,
            small_slot_len: 4096,
            small_slots: 4,
        },
        open_retry_ms: 20,
        drain_timeout_ms: 2_000,
        ..Default::default()
    };
    config.negotiation.handshake_retry_ms = 20;
    config.negotiation.settle_timeout_ms = 5_000;
    config
}

#[test]
fn services_negotiate_and_forward_over_tcp() {
    let (server, client) = link();
    let a = CmiService::new(
        service_config(SpId::A),
        Arc::clone(&server) as Arc<dyn Transport>,
        Arc::new(Mirror),
    )
    .unwrap();
    let b = CmiService::new(
        service_config(SpId::B),
        Arc::clone(&client) as Arc<dyn Transport>,
        Arc::new(Mirror),
    )
    .unwrap();

    let (ra, rb) = crossbeam::thread::scope(|s| {
        let ha = s.spawn(|_| a.start().unwrap());
        let hb = s.spawn(|_| b.start().unwrap());
        (ha.join().unwrap(), hb.join().unwrap())
    })
    .unwrap();
    assert_eq!(ra, Role::Active);
    assert_eq!(rb, Role::Passive);
    assert!(wait_until(WAIT, || a.info().peer_table && b.info().peer_table));

    let (op, pending) = Operation::control(3, SgList::single(b"abcdef".to_vec()));
    b.forward(op).unwrap();
    let completion = pending.wait_timeout(WAIT).expect("control operation timed out");
    assert!(completion.status.is_ok());
    assert_eq!(completion.payload.gather(), b"fedcba".to_vec());

    b.destroy();
    a.destroy();
}
