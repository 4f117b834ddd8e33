//! Error types for dmsg.

use std::io;

use thiserror::Error;

use crate::crypto::PubKey;
use crate::discovery::DiscoveryError;
use crate::transport::{CloseReason, FrameError};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level dmsg errors.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Noise handshake did not complete in time.
    #[error("noise handshake timed out")]
    HandshakeTimeout,

    /// Noise handshake failed.
    #[error("noise handshake failed: {0}")]
    HandshakeFailed(String),

    /// Packet could not be encrypted.
    #[error("noise encryption failed")]
    EncryptFailed,

    /// Packet could not be decrypted.
    #[error("noise decryption failed")]
    DecryptFailed,

    /// Write exceeds what a single Noise packet can carry.
    #[error("short write: {len} bytes exceeds maximum packet size {max}")]
    ShortWrite {
        /// Requested length.
        len: usize,
        /// Maximum length.
        max: usize,
    },

    /// Malformed frame from the remote.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Frame type not valid in the current state.
    #[error("unexpected {kind} frame for transport {tp_id}")]
    UnexpectedFrame {
        /// Frame type name.
        kind: &'static str,
        /// Transport ID.
        tp_id: u16,
    },

    /// ACCEPT contents or transport ID parity did not match the request.
    #[error("accept check failed: {0}")]
    AcceptCheckFailed(String),

    /// The responder (or relay) closed the transport during the handshake.
    #[error("request rejected: {0}")]
    RequestRejected(CloseReason),

    /// No ACCEPT arrived in time.
    #[error("timed out waiting for accept")]
    AcceptTimeout,

    /// Nobody is listening on the requested port.
    #[error("port {0} is not listening")]
    PortNotListening(u16),

    /// Port already reserved.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// All ephemeral ports are taken.
    #[error("no free ephemeral port")]
    NoFreePorts,

    /// All transport IDs of a connection are taken.
    #[error("no free transport id")]
    NoFreeIds,

    /// Listener accept queue is full.
    #[error("accept buffer full on port {0}")]
    AcceptBufferFull(u16),

    /// Remote has no delegated servers.
    #[error("remote {0} has no delegated servers")]
    NoSrv(PubKey),

    /// Discovery entry has the wrong role.
    #[error("entry of {0} is not a server entry")]
    NotServer(PubKey),

    /// Every candidate server failed.
    #[error("dial failed on all {} servers: {}", .0.len(), join_errors(.0))]
    DialFailed(Vec<Error>),

    /// Transport is closed.
    #[error("io: read/write on closed pipe")]
    ClosedPipe,

    /// Connection is closed.
    #[error("connection closed")]
    ConnClosed,

    /// Listener is closed.
    #[error("listener closed")]
    ListenerClosed,

    /// Client is closed.
    #[error("client closed")]
    ClientClosed,

    /// Server is closed.
    #[error("server closed")]
    ServerClosed,

    /// Discovery error.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl Error {
    /// Network errors are worth reconnecting over; everything else is a
    /// protocol, capacity or discovery failure.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Io(_) | Self::HandshakeTimeout | Self::ConnClosed | Self::AcceptTimeout => true,
            Self::Discovery(e) => e.is_network(),
            _ => false,
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
