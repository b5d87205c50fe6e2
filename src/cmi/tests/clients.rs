mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cmi::registry::OpenState;
use cmi::{ClientId, ConduitId, Error};

use common::*;

#[test]
fn user_messages_reach_the_peer_client() {
    let pair = pair();
    let (ra, rb) = (Recorder::new(), Recorder::new());
    pair.a
        .service
        .register(ClientId::User(1), ra.clone(), Arc::new(()))
        .unwrap();
    pair.b
        .service
        .register(ClientId::User(1), rb.clone(), Arc::new(()))
        .unwrap();

    pair.a
        .service
        .send(ClientId::User(1), ConduitId::Service, b"ping".to_vec(), None)
        .unwrap();
    assert!(wait_until(WAIT, || ra.count("Transmitted") == 1));
    assert_eq!(*rb.messages.lock().unwrap(), vec![b"ping".to_vec()]);

    assert!(matches!(
        pair.a.service.register(ClientId::User(1), ra.clone(), Arc::new(())),
        Err(Error::AlreadyRegistered(_))
    ));
    assert!(matches!(
        pair.a.service.unregister(ClientId::SepIo),
        Err(Error::InvalidClient(_))
    ));
    pair.a.service.unregister(ClientId::User(1)).unwrap();
}

#[test]
fn open_handshake_gates_sends() {
    let pair = pair();
    let (ra, rb) = (Recorder::new(), Recorder::new());
    pair.a
        .service
        .register(ClientId::Database, ra.clone(), Arc::new(()))
        .unwrap();
    pair.b
        .service
        .register(ClientId::Database, rb.clone(), Arc::new(()))
        .unwrap();

    let err = pair
        .b
        .service
        .send(ClientId::Database, ConduitId::Database, vec![1], None)
        .unwrap_err();
    assert!(matches!(err, Error::OpenNotEstablished(ClientId::Database)));
    // the refusal was also reported to the callback
    assert_eq!(rb.count("PeerNotPresent"), 1);

    // the active side becomes ready a little later
    let a = Arc::clone(&pair.a.service);
    let ready = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        a.mark_ready(ClientId::Database).unwrap();
    });
    pair.b.service.mark_ready(ClientId::Database).unwrap();
    pair.b
        .service
        .sync_open(ClientId::Database, WAIT)
        .unwrap();
    ready.join().unwrap();

    let open = pair.b.service.registry().open_state(ClientId::Database).unwrap();
    assert!(open.contains(OpenState::OPEN_ESTABLISHED));
    assert!(wait_until(WAIT, || pair
        .a
        .service
        .registry()
        .open_state(ClientId::Database)
        .map_or(false, |o| o.contains(OpenState::OPEN_ESTABLISHED))));

    pair.b
        .service
        .send(ClientId::Database, ConduitId::Database, vec![2], None)
        .unwrap();
    assert!(wait_until(WAIT, || ra.messages.lock().unwrap().len() == 1));
}

#[test]
fn sync_open_on_the_active_side_returns_at_once() {
    let pair = pair();
    let ra = Recorder::new();
    pair.a
        .service
        .register(ClientId::Persist, ra, Arc::new(()))
        .unwrap();
    pair.a
        .service
        .sync_open(ClientId::Persist, Duration::from_millis(1))
        .unwrap();
}

#[test]
fn contact_loss_releases_open_waiters() {
    let pair = pair();
    let rb = Recorder::new();
    pair.b
        .service
        .register(ClientId::Metadata, rb.clone(), Arc::new(()))
        .unwrap();
    let b = Arc::clone(&pair.b.service);
    let waiter = thread::spawn(move || b.sync_open(ClientId::Metadata, WAIT));
    thread::sleep(Duration::from_millis(50));
    pair.b.transport.disconnect();
    let res = waiter.join().unwrap();
    assert!(matches!(res, Err(Error::ContactLost) | Err(Error::PeerNotPresent)));
    assert!(wait_until(WAIT, || rb.count("ContactLost") == 1));
}

#[test]
fn disabled_traffic_refuses_and_drains() {
    let pair = pair();
    let ra = Recorder::new();
    pair.a
        .service
        .register(ClientId::Job, ra.clone(), Arc::new(()))
        .unwrap();
    pair.b
        .service
        .register(ClientId::Job, Recorder::new(), Arc::new(()))
        .unwrap();

    pair.a.transport.set_hold_acks(true);
    pair.a
        .service
        .send(ClientId::Job, ConduitId::Job, vec![1], None)
        .unwrap();
    pair.a.transport.flush();
    assert!(matches!(
        pair.a.service.disable_traffic(Duration::from_millis(30)),
        Err(Error::Timeout(_))
    ));
    assert!(matches!(
        pair.a.service.send(ClientId::Job, ConduitId::Job, vec![2], None),
        Err(Error::TrafficDisabled)
    ));

    pair.a.transport.set_hold_acks(false);
    pair.a.transport.release_held_acks();
    pair.a.service.disable_traffic(WAIT).unwrap();
    assert_eq!(pair.a.service.registry().outstanding_messages(), 0);

    pair.a.service.enable_traffic();
    pair.a
        .service
        .send(ClientId::Job, ConduitId::Job, vec![3], None)
        .unwrap();
    assert!(wait_until(WAIT, || ra.count("Transmitted") == 2));
}

#[test]
fn memory_messages_use_io_slots() {
    let pair = pair();
    let (ra, rb) = (Recorder::new(), Recorder::new());
    pair.a
        .service
        .register(ClientId::User(2), ra.clone(), Arc::new(()))
        .unwrap();
    pair.b
        .service
        .register(ClientId::User(2), rb.clone(), Arc::new(()))
        .unwrap();

    pair.a
        .service
        .send_memory(ClientId::User(2), Some(Box::new(7u32)), b"hello")
        .unwrap();
    assert!(wait_until(WAIT, || ra.count("Transmitted") == 1));
    assert_eq!(*rb.messages.lock().unwrap(), vec![b"hello".to_vec()]);
    assert!(rb.events.lock().unwrap()[0].starts_with("Received(SepIo0"));
    assert!(wait_until(WAIT, || pair.a.service.engine().pools_idle()));

    let big = vec![0u8; cmi::io::MAX_MEMORY_MESSAGE_LEN + 1];
    assert!(matches!(
        pair.a.service.send_memory(ClientId::User(2), None, &big),
        Err(Error::PayloadTooLarge { .. })
    ));
}

#[test]
fn memory_messages_overflow_when_every_slot_is_busy() {
    let pair = pair_with(&|c| {
        c.pools.large_slots = 1;
        c.pools.small_slots = 1;
    });
    let rb = Recorder::new();
    pair.b
        .service
        .register(ClientId::User(4), rb.clone(), Arc::new(()))
        .unwrap();
    pair.a
        .service
        .register(ClientId::User(4), Recorder::new(), Arc::new(()))
        .unwrap();

    pair.b.volume.pause();
    let (op, large) = write(0, pattern(1, 16 * BLOCK as usize));
    pair.a.service.forward(op).unwrap();
    let (op, small) = write(1, pattern(2, BLOCK as usize));
    pair.a.service.forward(op).unwrap();
    assert!(wait_until(WAIT, || pair.b.volume.parked() == 2));

    pair.a
        .service
        .send_memory(ClientId::User(4), None, b"status")
        .unwrap();
    assert!(wait_until(WAIT, || rb.count("Received") == 1));
    assert_eq!(*rb.messages.lock().unwrap(), vec![b"status".to_vec()]);

    pair.b.volume.resume();
    assert!(done(large).status.is_ok());
    assert!(done(small).status.is_ok());
    assert!(wait_until(WAIT, || pair.a.service.engine().pools_idle()));
}

#[test]
fn panic_permission_goes_to_one_node() {
    let pair = pair();
    assert!(pair
        .a
        .service
        .request_panic_permission(WAIT)
        .unwrap());
    assert!(!pair
        .b
        .service
        .request_panic_permission(WAIT)
        .unwrap());

    pair.a.service.release_panic_permission();
    assert!(wait_until(WAIT, || pair
        .b
        .service
        .request_panic_permission(WAIT)
        .unwrap_or(false)));
}
