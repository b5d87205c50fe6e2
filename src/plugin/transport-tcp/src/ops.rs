//! Wire framing and non-blocking socket I/O.
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

use mio::net::TcpStream;
use serde::{Deserialize, Serialize};

use cmi::{ClientId, ConduitId};

use super::TransportError;

pub const MAGIC: u32 = 0x434d_4931;
const MAGIC_BYTES: usize = std::mem::size_of::<u32>();
pub const HEADER_BYTES: usize = MAGIC_BYTES + std::mem::size_of::<u32>() + std::mem::size_of::<u64>();
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Delivered,
    /// Nobody was attached on the receiving node.
    NotPresent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Data {
        seq: u64,
        conduit: ConduitId,
        client: ClientId,
        payload: Vec<u8>,
    },
    Ack {
        seq: u64,
        status: AckStatus,
    },
    Heartbeat,
}

impl Frame {
    fn tag(&self) -> u32 {
        match self {
            Frame::Data { .. } => 1,
            Frame::Ack { .. } => 2,
            Frame::Heartbeat => 3,
        }
    }
}

/// Format:
/// | magic | tag | len |  bincode(frame) |
/// |   4   |  4  |  8  |       len       |
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, TransportError> {
    let body = bincode::serialize(frame)?;
    let mut buf = Vec::with_capacity(HEADER_BYTES + body.len());
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&frame.tag().to_le_bytes());
    buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn le_u32(b: &[u8]) -> u32 {
    let mut a = [0; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

/// Reassembles frames from a byte stream.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: u64,
}

impl FrameDecoder {
    pub fn new(max_frame_len: u64) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, if any. An error poisons the stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buf.len() < HEADER_BYTES {
            return Ok(None);
        }
        let magic = le_u32(&self.buf[..MAGIC_BYTES]);
        if magic != MAGIC {
            return Err(TransportError::BadMagic(magic));
        }
        let len = le_u64(&self.buf[8..HEADER_BYTES]);
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge(len));
        }
        let total = HEADER_BYTES + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame = bincode::deserialize(&self.buf[HEADER_BYTES..total])?;
        self.buf.drain(..total);
        Ok(Some(frame))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// The socket to the peer with its pending output and partial input.
pub struct Connection {
    sock: TcpStream,
    decoder: FrameDecoder,
    send_tasks: VecDeque<Vec<u8>>,
    offset: usize,
    established: bool,
    last_rx: Instant,
}

impl Connection {
    pub fn new(sock: TcpStream, max_frame_len: u64, established: bool) -> Self {
        Connection {
            sock,
            decoder: FrameDecoder::new(max_frame_len),
            send_tasks: VecDeque::with_capacity(128),
            offset: 0,
            established,
            last_rx: Instant::now(),
        }
    }

    #[inline]
    pub fn sock_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Completes a non-blocking connect. Returns true once the socket is usable.
    pub fn finish_connect(&mut self) -> Result<bool, TransportError> {
        if self.established {
            return Ok(true);
        }
        if let Some(e) = self.sock.take_error()? {
            return Err(e.into());
        }
        match self.sock.peer_addr() {
            Ok(_) => {
                self.established = true;
                self.last_rx = Instant::now();
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    pub fn queue(&mut self, bytes: Vec<u8>) {
        self.send_tasks.push_back(bytes);
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.send_tasks.is_empty()
    }

    /// Writes queued frames until done or the socket would block. Returns true if it
    /// would block with data left.
    pub fn check_write(&mut self) -> Result<bool, TransportError> {
        while let Some(task) = self.send_tasks.front() {
            match self.sock.write(&task[self.offset..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == task.len() {
                        self.send_tasks.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Socket(e)),
            }
        }
        Ok(false)
    }

    /// Reads until the socket would block and decodes every complete frame.
    pub fn check_read(&mut self, frames: &mut Vec<Frame>) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.sock.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    self.decoder.push(&chunk[..n]);
                    self.last_rx = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Socket(e)),
            }
        }
        while let Some(frame) = self.decoder.next_frame()? {
            frames.push(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u64, len: usize) -> Frame {
        Frame::Data {
            seq,
            conduit: ConduitId::SepIo(1),
            client: ClientId::SepIo,
            payload: vec![0xab; len],
        }
    }

    #[test]
    fn frames_split_across_reads() {
        let mut bytes = encode_frame(&data(1, 300)).unwrap();
        bytes.extend(encode_frame(&Frame::Heartbeat).unwrap());
        bytes.extend(encode_frame(&Frame::Ack {
            seq: 1,
            status: AckStatus::Delivered,
        })
        .unwrap());

        let mut decoder = FrameDecoder::new(1 << 20);
        let mut frames = Vec::new();
        for piece in bytes.chunks(7) {
            decoder.push(piece);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], data(1, 300));
        assert_eq!(frames[1], Frame::Heartbeat);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_frame(&Frame::Heartbeat).unwrap();
        bytes[0] ^= 0xff;
        let mut decoder = FrameDecoder::new(1 << 20);
        decoder.push(&bytes);
        assert!(matches!(decoder.next_frame(), Err(TransportError::BadMagic(_))));
    }

    #[test]
    fn oversized_frame_is_rejected_from_its_header() {
        let bytes = encode_frame(&data(2, 4096)).unwrap();
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&bytes[..HEADER_BYTES]);
        assert!(matches!(
            decoder.next_frame(),
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
