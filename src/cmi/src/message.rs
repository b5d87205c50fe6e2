//! Messages exchanged by the service client over the `Service` conduit.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conduit::{ClientId, SpId};
use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub sp: SpId,
    pub role: Role,
    /// Random per boot, used to notice a peer that restarted without a contact loss.
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMessage {
    Handshake(Handshake),
    Open { client: ClientId },
    OpenAck { client: ClientId },
    PanicRequest { sp: SpId, nonce: u64 },
    PanicReply { nonce: u64, granted: bool },
    PanicRelease { sp: SpId },
}

/// Send context of service messages, returned with the transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceToken {
    Handshake,
    Open(ClientId),
    Panic,
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_survives_codec() {
        let msg = ServiceMessage::Handshake(Handshake {
            sp: SpId::B,
            role: Role::Passive,
            incarnation: 0xdead_beef,
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode::<ServiceMessage>(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode::<ServiceMessage>(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
