//! Active/Passive role negotiation.
//!
//! Each node starts `Busy` and sends a [`Handshake`] carrying its current role over the
//! service conduit. Received handshakes drive the transition table in [`transition`]; a
//! failed or lost peer pushes a waiting node to `Active`. Handshakes are sent from a
//! dedicated thread so callers on transport callback paths never block on the transport.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::conduit::SpId;
use crate::message::Handshake;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    Busy = 0,
    Active = 1,
    Passive = 2,
    ServiceMode = 3,
}

impl Role {
    fn from_u8(v: u8) -> Role {
        match v {
            1 => Role::Active,
            2 => Role::Passive,
            3 => Role::ServiceMode,
            _ => Role::Busy,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Busy
    }
}

/// Lock-free view of the negotiated state, read by every other component.
#[derive(Debug, Default)]
pub struct NodeStatus {
    role: AtomicU8,
    peer_alive: AtomicBool,
    peer_degraded: AtomicBool,
}

impl NodeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    #[inline]
    pub fn peer_alive(&self) -> bool {
        self.peer_alive.load(Ordering::Acquire)
    }

    #[inline]
    pub fn peer_degraded(&self) -> bool {
        self.peer_degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub(crate) fn set_peer_alive(&self, alive: bool) {
        self.peer_alive.store(alive, Ordering::Release);
    }

    pub(crate) fn set_peer_degraded(&self, degraded: bool) {
        self.peer_degraded.store(degraded, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) role: Role,
    pub(crate) peer_degraded: bool,
    pub(crate) rehandshake: bool,
}

/// New role of `sp` holding `this` after the peer reported `peer`.
pub(crate) fn transition(sp: SpId, this: Role, peer: Role) -> Transition {
    use Role::*;

    let tie_break = || if sp.wins_tie_break() { Active } else { Passive };
    let (role, rehandshake) = match (this, peer) {
        (Busy | Passive, ServiceMode) => (Active, false),
        (current, ServiceMode) => (current, false),
        (Busy, Busy) => (tie_break(), false),
        (Busy, Active) => (Passive, false),
        (Busy, Passive) => (Active, false),
        (Active | ServiceMode, Busy) => (this, true),
        (Active, Active) => {
            tracing::error!("{}: both nodes claim Active", sp);
            (Active, false)
        }
        (Passive, Active) => (Passive, false),
        (Active, Passive) => (Active, false),
        (Passive, Passive) => (tie_break(), true),
        (Passive, Busy) => (Passive, true),
        (ServiceMode, Active | Passive) => (ServiceMode, false),
    };
    Transition {
        role,
        peer_degraded: peer == ServiceMode,
        rehandshake: rehandshake || role != this,
    }
}

/// Sends a handshake to the peer. Implemented by the client registry.
pub trait HandshakeSender: Send + Sync {
    fn send_handshake(&self, handshake: Handshake);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub previous: Role,
    pub role: Role,
    pub peer_restarted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub role: Role,
    pub peer_role: Option<Role>,
    pub peer_alive: bool,
    pub peer_degraded: bool,
}

#[derive(Debug, Default)]
struct RoleState {
    role: Role,
    peer_role: Option<Role>,
    peer_incarnation: Option<u64>,
}

enum Command {
    Handshake,
    Stop,
}

pub struct RoleNegotiator {
    sp: SpId,
    incarnation: u64,
    status: Arc<NodeStatus>,
    state: Mutex<RoleState>,
    settled: Condvar,
    commands: Sender<Command>,
    inbox: spin::Mutex<Option<Receiver<Command>>>,
    worker: spin::Mutex<Option<JoinHandle<()>>>,
}

impl RoleNegotiator {
    pub fn new(sp: SpId, status: Arc<NodeStatus>) -> Self {
        let (commands, inbox) = channel::unbounded();
        status.set_role(Role::Busy);
        RoleNegotiator {
            sp,
            incarnation: uuid::Uuid::new_v4().as_u64_pair().0,
            status,
            state: Mutex::new(RoleState::default()),
            settled: Condvar::new(),
            commands,
            inbox: spin::Mutex::new(Some(inbox)),
            worker: spin::Mutex::new(None),
        }
    }

    #[inline]
    pub fn sp(&self) -> SpId {
        self.sp
    }

    #[inline]
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.status.role()
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        RoleSnapshot {
            role: state.role,
            peer_role: state.peer_role,
            peer_alive: self.status.peer_alive(),
            peer_degraded: self.status.peer_degraded(),
        }
    }

    /// Spawns the handshake sender thread. Once settled, while the peer is not known to
    /// be alive, the thread resends a handshake every `retry` so contact is re-established
    /// when the link comes back. Calling it twice is a no-op.
    pub fn start(&self, sender: Arc<dyn HandshakeSender>, retry: Duration) -> io::Result<()> {
        let inbox = match self.inbox.lock().take() {
            Some(inbox) => inbox,
            None => return Ok(()),
        };
        let status = Arc::clone(&self.status);
        let sp = self.sp;
        let incarnation = self.incarnation;
        let handle = thread::Builder::new()
            .name(format!("cmi-handshake-{}", sp))
            .spawn(move || {
                let handshake = || Handshake {
                    sp,
                    role: status.role(),
                    incarnation,
                };
                loop {
                    match inbox.recv_timeout(retry) {
                        Ok(Command::Handshake) => sender.send_handshake(handshake()),
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if !status.peer_alive() && status.role() != Role::Busy {
                                tracing::trace!("{}: peer silent, resending handshake", sp);
                                sender.send_handshake(handshake());
                            }
                        }
                    }
                }
                tracing::debug!("{}: handshake sender exits", sp);
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Queues a handshake carrying the role at the time it is sent.
    pub fn send_handshake(&self) {
        if self.commands.send(Command::Handshake).is_err() {
            tracing::warn!("{}: handshake sender is gone", self.sp);
        }
    }

    pub fn on_handshake_received(&self, handshake: Handshake) -> HandshakeOutcome {
        if handshake.sp == self.sp {
            tracing::error!("{}: received a handshake claiming our own identity", self.sp);
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let first_contact = state.peer_role.is_none();
        let peer_restarted =
            matches!(state.peer_incarnation, Some(prev) if prev != handshake.incarnation);
        state.peer_incarnation = Some(handshake.incarnation);
        state.peer_role = Some(handshake.role);

        let previous = state.role;
        let t = transition(self.sp, previous, handshake.role);
        state.role = t.role;
        self.status.set_role(t.role);
        self.status.set_peer_alive(true);
        self.status.set_peer_degraded(t.peer_degraded);
        if t.role != Role::Busy {
            self.settled.notify_all();
        }
        drop(state);

        if previous != t.role {
            tracing::info!(
                "{}: role {:?} -> {:?}, peer reported {:?}",
                self.sp,
                previous,
                t.role,
                handshake.role
            );
        }
        if peer_restarted {
            tracing::warn!("{}: peer restarted", self.sp);
        }
        // the peer may not know about us yet, e.g. after the link came back
        if t.rehandshake || peer_restarted || first_contact {
            self.send_handshake();
        }
        HandshakeOutcome {
            previous,
            role: t.role,
            peer_restarted,
        }
    }

    pub fn on_transmit_ack(&self) {
        self.status.set_peer_alive(true);
    }

    /// Our handshake could not reach the peer.
    pub fn on_peer_not_present(&self) -> Role {
        self.presume_peer_gone(false)
    }

    /// The transport reported the peer dead.
    pub fn on_contact_lost(&self) -> Role {
        self.presume_peer_gone(true)
    }

    fn presume_peer_gone(&self, contact_lost: bool) -> Role {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.role;
        state.role = match previous {
            Role::Busy | Role::Passive => Role::Active,
            other => other,
        };
        if contact_lost {
            state.peer_role = None;
            state.peer_incarnation = None;
            self.status.set_peer_degraded(false);
        }
        self.status.set_peer_alive(false);
        self.status.set_role(state.role);
        let role = state.role;
        self.settled.notify_all();
        drop(state);

        if previous != role {
            tracing::info!(
                "{}: role {:?} -> {:?}, peer {}",
                self.sp,
                previous,
                role,
                if contact_lost { "lost" } else { "not present" }
            );
        }
        role
    }

    pub fn enter_service_mode(&self) {
        self.force_role(Role::ServiceMode);
    }

    /// Leaves service mode and renegotiates from `Busy`.
    pub fn leave_service_mode(&self) {
        if self.role() == Role::ServiceMode {
            self.force_role(Role::Busy);
        }
    }

    fn force_role(&self, role: Role) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.role;
        state.role = role;
        self.status.set_role(role);
        drop(state);
        tracing::info!("{}: role {:?} -> {:?} by administrator", self.sp, previous, role);
        self.send_handshake();
    }

    /// Blocks until the role leaves `Busy`, resending the handshake every `retry`.
    pub fn wait_settled(&self, budget: Duration, retry: Duration) -> Result<Role, Error> {
        let deadline = Instant::now() + budget;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.role != Role::Busy {
                return Ok(state.role);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::error!("{}: role still Busy after {:?}", self.sp, budget);
                return Err(Error::RoleNotSettled(budget));
            }
            self.send_handshake();
            let wait = retry.min(deadline - now);
            state = self
                .settled
                .wait_timeout_while(state, wait, |s| s.role == Role::Busy)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for RoleNegotiator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Role::*;

    #[test]
    fn busy_busy_uses_tie_break() {
        assert_eq!(transition(SpId::A, Busy, Busy).role, Active);
        assert_eq!(transition(SpId::B, Busy, Busy).role, Passive);
    }

    #[test]
    fn table() {
        let sp = SpId::B;
        assert_eq!(transition(sp, Busy, Active).role, Passive);
        assert_eq!(transition(sp, Busy, Passive).role, Active);
        assert_eq!(transition(sp, Passive, Active).role, Passive);
        assert_eq!(transition(sp, Active, Passive).role, Active);

        let t = transition(sp, Active, Busy);
        assert_eq!(t.role, Active);
        assert!(t.rehandshake);

        let t = transition(sp, ServiceMode, Busy);
        assert_eq!(t.role, ServiceMode);
        assert!(t.rehandshake);

        let t = transition(sp, Active, Active);
        assert_eq!(t.role, Active);
        assert!(!t.rehandshake);
    }

    #[test]
    fn peer_in_service_mode() {
        for (this, expected) in [
            (Busy, Active),
            (Passive, Active),
            (Active, Active),
            (ServiceMode, ServiceMode),
        ] {
            let t = transition(SpId::B, this, ServiceMode);
            assert_eq!(t.role, expected);
            assert!(t.peer_degraded);
        }
    }

    #[test]
    fn role_change_rehandshakes() {
        assert!(transition(SpId::A, Busy, Busy).rehandshake);
        assert!(!transition(SpId::A, Passive, Active).rehandshake);
    }

    /// Two nodes exchanging handshakes synchronously settle on one Active and one Passive.
    #[test]
    fn every_reachable_pair_converges() {
        let roles = [Busy, Active, Passive];
        for a0 in roles {
            for b0 in roles {
                if a0 == Active && b0 == Active {
                    continue;
                }
                let (mut a, mut b) = (a0, b0);
                for _ in 0..4 {
                    let na = transition(SpId::A, a, b).role;
                    let nb = transition(SpId::B, b, a).role;
                    a = na;
                    b = nb;
                }
                let pair = [a, b];
                assert!(pair.contains(&Active), "{:?}/{:?} -> {:?}", a0, b0, pair);
                assert!(pair.contains(&Passive), "{:?}/{:?} -> {:?}", a0, b0, pair);
            }
        }
    }

    #[test]
    fn peer_not_present_promotes() {
        let status = Arc::new(NodeStatus::new());
        let negotiator = RoleNegotiator::new(SpId::B, Arc::clone(&status));
        assert_eq!(negotiator.on_peer_not_present(), Active);
        assert_eq!(status.role(), Active);
        assert!(!status.peer_alive());
    }

    #[test]
    fn contact_lost_promotes_passive() {
        let status = Arc::new(NodeStatus::new());
        let negotiator = RoleNegotiator::new(SpId::B, Arc::clone(&status));
        negotiator.on_handshake_received(Handshake {
            sp: SpId::A,
            role: Active,
            incarnation: 1,
        });
        assert_eq!(status.role(), Passive);
        assert!(status.peer_alive());
        assert_eq!(negotiator.on_contact_lost(), Active);
        assert!(!status.peer_alive());
    }

    #[test]
    fn service_mode_is_sticky() {
        let status = Arc::new(NodeStatus::new());
        let negotiator = RoleNegotiator::new(SpId::A, Arc::clone(&status));
        negotiator.enter_service_mode();
        assert_eq!(negotiator.on_peer_not_present(), ServiceMode);
        negotiator.on_handshake_received(Handshake {
            sp: SpId::B,
            role: Active,
            incarnation: 7,
        });
        assert_eq!(status.role(), ServiceMode);
        negotiator.leave_service_mode();
        assert_eq!(status.role(), Busy);
    }

    #[test]
    fn restart_is_detected_by_incarnation() {
        let negotiator = RoleNegotiator::new(SpId::A, Arc::new(NodeStatus::new()));
        let hs = |incarnation| Handshake {
            sp: SpId::B,
            role: Busy,
            incarnation,
        };
        assert!(!negotiator.on_handshake_received(hs(1)).peer_restarted);
        assert!(!negotiator.on_handshake_received(hs(1)).peer_restarted);
        assert!(negotiator.on_handshake_received(hs(2)).peer_restarted);
    }

    #[derive(Default)]
    struct Counter(std::sync::atomic::AtomicUsize);

    impl Counter {
        fn sent(&self) -> usize {
            self.0.load(Ordering::Acquire)
        }
    }

    impl HandshakeSender for Counter {
        fn send_handshake(&self, _handshake: Handshake) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn silent_peer_is_handshaken_again() {
        let status = Arc::new(NodeStatus::new());
        let negotiator = RoleNegotiator::new(SpId::A, Arc::clone(&status));
        let counter = Arc::new(Counter::default());
        negotiator
            .start(Arc::clone(&counter) as Arc<dyn HandshakeSender>, Duration::from_millis(5))
            .unwrap();
        // nothing is resent while Busy, `wait_settled` owns that
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.sent(), 0);

        negotiator.on_contact_lost();
        assert!(wait_for(|| counter.sent() >= 3));

        negotiator.on_handshake_received(Handshake {
            sp: SpId::B,
            role: Active,
            incarnation: 9,
        });
        // the answer to a first contact, then silence
        thread::sleep(Duration::from_millis(30));
        let settled = counter.sent();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.sent(), settled);
        negotiator.shutdown();
    }

    #[test]
    fn first_contact_after_loss_is_answered() {
        let negotiator = RoleNegotiator::new(SpId::A, Arc::new(NodeStatus::new()));
        let hs = Handshake {
            sp: SpId::B,
            role: Passive,
            incarnation: 4,
        };
        let counter = Arc::new(Counter::default());
        negotiator
            .start(Arc::clone(&counter) as Arc<dyn HandshakeSender>, Duration::from_secs(60))
            .unwrap();
        negotiator.on_handshake_received(hs);
        assert!(wait_for(|| counter.sent() == 1));
        negotiator.on_handshake_received(hs);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.sent(), 1);

        negotiator.on_contact_lost();
        negotiator.on_handshake_received(hs);
        assert!(wait_for(|| counter.sent() == 2));
    }

    #[test]
    fn poisoned_state_does_not_panic() {
        let negotiator = Arc::new(RoleNegotiator::new(SpId::B, Arc::new(NodeStatus::new())));
        let n2 = Arc::clone(&negotiator);
        let poisoner = thread::spawn(move || {
            let _state = n2.state.lock().unwrap();
            panic!("poison the role state");
        });
        assert!(poisoner.join().is_err());
        assert!(negotiator.state.is_poisoned());

        assert_eq!(negotiator.on_contact_lost(), Active);
        assert_eq!(negotiator.snapshot().role, Active);
        assert_eq!(
            negotiator
                .wait_settled(Duration::from_millis(10), Duration::from_millis(5))
                .unwrap(),
            Active
        );
    }

    #[test]
    fn wait_settled_times_out() {
        let negotiator = RoleNegotiator::new(SpId::A, Arc::new(NodeStatus::new()));
        let err = negotiator
            .wait_settled(Duration::from_millis(30), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::RoleNotSettled(_)));
    }

    #[test]
    fn wait_settled_wakes_on_handshake() {
        let negotiator = Arc::new(RoleNegotiator::new(SpId::B, Arc::new(NodeStatus::new())));
        let n2 = Arc::clone(&negotiator);
        let waiter = thread::spawn(move || {
            n2.wait_settled(Duration::from_secs(10), Duration::from_millis(50))
        });
        thread::sleep(Duration::from_millis(20));
        negotiator.on_handshake_received(Handshake {
            sp: SpId::A,
            role: Busy,
            incarnation: 3,
        });
        assert_eq!(waiter.join().unwrap().unwrap(), Passive);
    }
}
