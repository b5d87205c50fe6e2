//! Frames exchanged by the forwarding engines on the I/O conduits.
use serde::{Deserialize, Serialize};

use super::operation::{OpId, OpStatus, OperationHeader, OperationKind, StatusDetail};
use super::slot::SlotKey;
use super::table::TranslationTable;
use crate::conduit::ClientId;

/// Slot bookkeeping that travels with every request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatHeader {
    pub key: SlotKey,
    /// Handle of the operation on the sending node.
    pub origin: OpId,
    /// Address of the slot in the receiver's staging area.
    pub address: u64,
    pub data_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadFrame {
    None,
    /// Copied through the sender's staging slot.
    Staged(Vec<u8>),
    /// The scatter list, segment by segment.
    Direct(Vec<Vec<u8>>),
}

impl PayloadFrame {
    pub fn len(&self) -> usize {
        match self {
            PayloadFrame::None => 0,
            PayloadFrame::Staged(data) => data.len(),
            PayloadFrame::Direct(segments) => segments.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub float: FloatHeader,
    pub header: OperationHeader,
    pub kind: OperationKind,
    pub payload: PayloadFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub float: FloatHeader,
    pub status: OpStatus,
    pub detail: StatusDetail,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoMessage {
    TranslationInfo {
        table: TranslationTable,
        have_peer_table: bool,
    },
    PacketRequest(RequestInfo),
    PacketResponse(ResponseInfo),
    PacketAbort {
        key: SlotKey,
        origin: OpId,
    },
    SendMemory {
        /// `None` for an overflow message sent while every slot was busy.
        key: Option<SlotKey>,
        client: ClientId,
        message: Vec<u8>,
    },
}

impl IoMessage {
    pub fn name(&self) -> &'static str {
        match self {
            IoMessage::TranslationInfo { .. } => "TranslationInfo",
            IoMessage::PacketRequest(_) => "PacketRequest",
            IoMessage::PacketResponse(_) => "PacketResponse",
            IoMessage::PacketAbort { .. } => "PacketAbort",
            IoMessage::SendMemory { .. } => "SendMemory",
        }
    }
}
