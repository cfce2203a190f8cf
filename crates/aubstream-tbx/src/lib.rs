#![forbid(unsafe_code)]

//! Blocking client for the TBX simulator protocol.
//!
//! A [`TbxClient`] owns one transport (normally a [`std::net::TcpStream`]) and mirrors MMIO,
//! PCI configuration, GTT and memory traffic to a remote simulator. Request/response pairs are
//! correlated by transaction id; any mismatch puts the client into a sticky error state after
//! which every call fails without touching the transport.

mod client;
mod config;
pub mod protocol;

use std::io;

use thiserror::Error;

pub use client::{ConnectionState, TbxClient, DEFAULT_LMEMBAR, LMEMBAR_PCI_FUNCTION};
pub use config::{TbxConfig, CONNECT_RETRY_INTERVAL, CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_PORT};
pub use protocol::{ControlFlags, DataFlags, Message, PciAddress};

pub type Result<T> = std::result::Result<T, TbxError>;

#[derive(Debug, Error)]
pub enum TbxError {
    #[error("failed to resolve simulator address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to simulator at {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("simulator socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("simulator closed the connection")]
    PeerClosed,

    #[error("TBX protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("TBX codec error: {0}")]
    Codec(#[from] protocol::Error),

    #[error("TBX session already failed")]
    SessionFailed,

    #[error("TBX client is not connected")]
    NotConnected,
}
