//! Panic permission: at most one node may decide to force a restart at a time.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conduit::SpId;
use crate::message::{ServiceMessage, ServiceToken};
use crate::registry::ClientRegistry;
use crate::role::NodeStatus;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbiterState {
    Idle,
    Requesting { nonce: u64 },
    /// This node may restart.
    Granted,
    /// The peer may restart.
    GrantedToPeer,
}

pub struct PanicArbiter {
    sp: SpId,
    registry: Arc<ClientRegistry>,
    status: Arc<NodeStatus>,
    state: Mutex<ArbiterState>,
    changed: Condvar,
    next_nonce: AtomicU64,
}

impl PanicArbiter {
    pub fn new(sp: SpId, registry: Arc<ClientRegistry>, status: Arc<NodeStatus>) -> Self {
        PanicArbiter {
            sp,
            registry,
            status,
            state: Mutex::new(ArbiterState::Idle),
            changed: Condvar::new(),
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ArbiterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: &mut ArbiterState, next: ArbiterState) {
        if *state != next {
            tracing::debug!("panic arbiter {:?} -> {:?}", *state, next);
            *state = next;
            self.changed.notify_all();
        }
    }

    /// Asks for permission to restart. Returns whether it was granted.
    pub fn request(&self, timeout: Duration) -> Result<bool, Error> {
        let nonce = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ArbiterState::Granted => return Ok(true),
                ArbiterState::GrantedToPeer => return Ok(false),
                ArbiterState::Requesting { .. } => return Err(Error::Busy),
                ArbiterState::Idle => {}
            }
            if !self.status.peer_alive() {
                self.set(&mut state, ArbiterState::Granted);
                return Ok(true);
            }
            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
            self.set(&mut state, ArbiterState::Requesting { nonce });
            nonce
        };

        let msg = ServiceMessage::PanicRequest { sp: self.sp, nonce };
        if let Err(e) = self.registry.send_service(&msg, ServiceToken::Panic) {
            tracing::debug!("panic request not sent: {}", e);
            self.on_send_failed();
        }

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| *s == ArbiterState::Requesting { nonce })
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            ArbiterState::Granted => Ok(true),
            ArbiterState::Requesting { nonce: n } if n == nonce => {
                self.set(&mut state, ArbiterState::Idle);
                Err(Error::Timeout("panic permission"))
            }
            _ => Ok(false),
        }
    }

    /// Gives up a granted permission and tells the peer.
    pub fn release(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ArbiterState::Granted {
                return;
            }
            self.set(&mut state, ArbiterState::Idle);
        }
        let msg = ServiceMessage::PanicRelease { sp: self.sp };
        if let Err(e) = self.registry.send_service(&msg, ServiceToken::Panic) {
            tracing::debug!("panic release not sent: {}", e);
        }
    }

    pub(crate) fn on_request(&self, peer: SpId, nonce: u64) {
        let granted = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ArbiterState::Idle => {
                    self.set(&mut state, ArbiterState::GrantedToPeer);
                    true
                }
                ArbiterState::Requesting { .. } if !self.sp.wins_tie_break() => {
                    self.set(&mut state, ArbiterState::GrantedToPeer);
                    true
                }
                _ => false,
            }
        };
        tracing::info!("panic request of {} {}", peer, if granted { "granted" } else { "denied" });
        let msg = ServiceMessage::PanicReply { nonce, granted };
        if let Err(e) = self.registry.send_service(&msg, ServiceToken::Panic) {
            tracing::debug!("panic reply not sent: {}", e);
        }
    }

    pub(crate) fn on_reply(&self, nonce: u64, granted: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == (ArbiterState::Requesting { nonce }) {
            let next = if granted {
                ArbiterState::Granted
            } else {
                ArbiterState::Idle
            };
            self.set(&mut state, next);
        } else {
            tracing::debug!("stale panic reply {} in {:?}", nonce, *state);
        }
    }

    pub(crate) fn on_release(&self, peer: SpId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ArbiterState::GrantedToPeer {
            tracing::info!("{} released its panic permission", peer);
            self.set(&mut state, ArbiterState::Idle);
        }
    }

    /// Our request could not reach the peer, which then cannot object.
    pub(crate) fn on_send_failed(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let ArbiterState::Requesting { .. } = *state {
            self.set(&mut state, ArbiterState::Granted);
        }
    }

    pub(crate) fn on_contact_lost(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ArbiterState::Requesting { .. } => self.set(&mut state, ArbiterState::Granted),
            ArbiterState::GrantedToPeer => self.set(&mut state, ArbiterState::Idle),
            _ => {}
        }
    }
}
