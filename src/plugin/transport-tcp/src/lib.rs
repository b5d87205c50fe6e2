//! TCP transport between the two storage processors.
//!
//! One node listens, the other connects. Every data frame is acknowledged by the
//! receiving node, which turns into the sender's terminal event; a broken connection or a
//! silent peer is reported as contact loss.
use std::io;
use thiserror::Error;

pub mod config;
pub mod engine;
pub mod ops;
pub(crate) mod state;

pub use config::TcpTransportConfig;
pub use engine::TcpTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket internal error: {0}.")]
    Socket(#[from] io::Error),
    #[error("Disconnected")]
    Disconnected,
    #[error("Bad frame magic {0:#x}")]
    BadMagic(u32),
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Invalid config: {0}")]
    Config(String),
}
