//! Small client messages carried through a send slot of the forwarding engine.
use super::message::IoMessage;
use super::slot::SlotAttrs;
use super::{acquire_for, lock_pools, EngineToken, IoEngine};
use crate::conduit::{ClientId, ConduitId};
use crate::message as codec;
use crate::transport::MessageContext;
use crate::Error;

pub const MAX_MEMORY_MESSAGE_LEN: usize = 512;

impl IoEngine {
    /// Ships `message` to `client` on the peer.
    ///
    /// The sender's callback gets the terminal event with `context`, also when this
    /// returns an error after the slot was taken. The message normally travels in a send
    /// slot; when every slot is busy it goes as an overflow message without one.
    pub fn send_memory(
        &self,
        client: ClientId,
        context: Option<MessageContext>,
        message: &[u8],
    ) -> Result<(), Error> {
        let len = message.len();
        if len > MAX_MEMORY_MESSAGE_LEN {
            return Err(Error::PayloadTooLarge {
                len,
                max: MAX_MEMORY_MESSAGE_LEN,
            });
        }
        if !self.status.peer_alive() {
            return Err(Error::PeerNotPresent);
        }
        let pools = self
            .pools()
            .filter(|_| self.tables.local_valid())
            .ok_or(Error::NotInitialized)?;
        if !self.tables.peer_valid() {
            self.trigger_exchange();
            return Err(Error::Busy);
        }

        let lease = {
            let mut guards = lock_pools(&pools);
            acquire_for(&mut guards, &pools, len)
        };
        let (key, staged, hold) = match lease {
            Some(mut lease) => {
                let key = lease.key();
                lease.staging_mut(len).copy_from_slice(message);
                lease.set_attrs(SlotAttrs::MEMORY_SENT);
                let staged = lease.staging(len).to_vec();
                let hold = lease.hold();
                lease.finish();
                match hold {
                    Some(hold) => (Some(key), staged, Some(hold)),
                    None => (None, staged, None),
                }
            }
            None => {
                tracing::debug!("no free slot, overflow memory message for {:?}", client);
                (None, message.to_vec(), None)
            }
        };

        let msg = IoMessage::SendMemory {
            key,
            client,
            message: staged,
        };
        let bytes = match codec::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(hold) = hold {
                    self.release_hold(hold);
                }
                return Err(e.into());
            }
        };
        tracing::trace!("memory message of {} bytes for {:?} in {:?}", len, client, key);
        self.registry.send(
            ClientId::SepIo,
            ConduitId::SepIo(0),
            bytes,
            Some(Box::new(EngineToken::Memory {
                hold,
                client,
                context,
            })),
        )
    }
}
