//! Frame encoding and decoding.
//!
//! Wire format:
//! ```text
//! +--------+------------------+----------------------+
//! | Type   | Transport ID     | Payload              |
//! | 1 byte | 2 bytes (BE16)   | variable             |
//! +--------+------------------+----------------------+
//! ```
//!
//! Payloads by type:
//! - REQUEST / ACCEPT: [`HandshakePayload`] (69 bytes, fixed layout)
//! - FWD: `[2-byte ack seq][data]`
//! - ACK: `[2-byte seq]`
//! - CLOSE: `[1-byte reason]`

use std::fmt;

use thiserror::Error;

use crate::core::{
    ACK_PAYLOAD_SIZE, Addr, FRAME_HEADER_SIZE, FWD_HEADER_SIZE, HANDSHAKE_PAYLOAD_SIZE,
    PROTOCOL_VERSION, PUBLIC_KEY_SIZE,
};
use crate::crypto::PubKey;

/// Frame parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Invalid frame type.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidType(u8),

    /// Handshake payload has the wrong size.
    #[error("invalid handshake payload length: {0}")]
    InvalidHandshakeLength(usize),

    /// Unsupported handshake version.
    #[error("unsupported handshake version: {0}")]
    UnsupportedVersion(u8),
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a transport.
    Request = 0x01,
    /// Confirm a transport.
    Accept = 0x02,
    /// Tear down a transport.
    Close = 0x03,
    /// Carry data.
    Fwd = 0x0a,
    /// Acknowledge a FWD.
    Ack = 0x0b,
}

impl FrameType {
    /// Parse frame type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Accept),
            0x03 => Some(Self::Close),
            0x0a => Some(Self::Fwd),
            0x0b => Some(Self::Ack),
            _ => None,
        }
    }

    /// Convert frame type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Close => "CLOSE",
            Self::Fwd => "FWD",
            Self::Ack => "ACK",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a transport was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    /// Ordinary close by either end.
    Normal = 0x00,
    /// The responder has no listener on the requested port.
    PortNotListening = 0x01,
    /// The responder's accept queue is full.
    AcceptBufferFull = 0x02,
    /// The relay has no connection to the responder.
    PeerUnavailable = 0x03,
    /// The frame that triggered the close broke the protocol.
    ProtocolViolation = 0x04,
}

impl CloseReason {
    /// Parse a reason byte. Unknown values read as [`CloseReason::Normal`].
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::PortNotListening,
            0x02 => Self::AcceptBufferFull,
            0x03 => Self::PeerUnavailable,
            0x04 => Self::ProtocolViolation,
            _ => Self::Normal,
        }
    }

    /// Convert to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "closed",
            Self::PortNotListening => "port not listening",
            Self::AcceptBufferFull => "accept buffer full",
            Self::PeerUnavailable => "peer unavailable",
            Self::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

/// Initiator IDs are even, relay-assigned responder IDs are odd.
pub fn is_initiator_id(tp_id: u16) -> bool {
    tp_id % 2 == 0
}

/// One frame on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameType,
    /// Transport the frame belongs to.
    pub tp_id: u16,
    /// Type-specific payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(kind: FrameType, tp_id: u16, payload: Vec<u8>) -> Self {
        Self {
            kind,
            tp_id,
            payload,
        }
    }

    /// REQUEST frame.
    pub fn request(tp_id: u16, hs: &HandshakePayload) -> Self {
        Self::new(FrameType::Request, tp_id, hs.encode().to_vec())
    }

    /// ACCEPT frame.
    pub fn accept(tp_id: u16, hs: &HandshakePayload) -> Self {
        Self::new(FrameType::Accept, tp_id, hs.encode().to_vec())
    }

    /// CLOSE frame.
    pub fn close(tp_id: u16, reason: CloseReason) -> Self {
        Self::new(FrameType::Close, tp_id, vec![reason.as_byte()])
    }

    /// FWD frame carrying `data` under ack sequence `seq`.
    pub fn fwd(tp_id: u16, seq: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(FWD_HEADER_SIZE + data.len());
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.extend_from_slice(data);
        Self::new(FrameType::Fwd, tp_id, payload)
    }

    /// ACK frame for sequence `seq`.
    pub fn ack(tp_id: u16, seq: u16) -> Self {
        Self::new(FrameType::Ack, tp_id, seq.to_be_bytes().to_vec())
    }

    /// Same frame re-tagged with another transport ID (used by the relay).
    pub fn with_id(mut self, tp_id: u16) -> Self {
        self.tp_id = tp_id;
        self
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.tp_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let kind = FrameType::from_byte(bytes[0]).ok_or(FrameError::InvalidType(bytes[0]))?;
        let tp_id = u16::from_be_bytes([bytes[1], bytes[2]]);
        Ok(Self::new(kind, tp_id, bytes[FRAME_HEADER_SIZE..].to_vec()))
    }

    /// Split a FWD payload into its ack sequence and data.
    pub fn fwd_parts(&self) -> Result<(u16, &[u8]), FrameError> {
        if self.payload.len() < FWD_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FWD_HEADER_SIZE,
                actual: self.payload.len(),
            });
        }
        let seq = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        Ok((seq, &self.payload[FWD_HEADER_SIZE..]))
    }

    /// Sequence of an ACK payload.
    pub fn ack_seq(&self) -> Result<u16, FrameError> {
        if self.payload.len() < ACK_PAYLOAD_SIZE {
            return Err(FrameError::TooShort {
                expected: ACK_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        Ok(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Reason of a CLOSE payload.
    pub fn close_reason(&self) -> CloseReason {
        self.payload
            .first()
            .map_or(CloseReason::Normal, |b| CloseReason::from_byte(*b))
    }

    /// Handshake payload of a REQUEST or ACCEPT.
    pub fn handshake(&self) -> Result<HandshakePayload, FrameError> {
        HandshakePayload::decode(&self.payload)
    }
}

/// Addresses exchanged by REQUEST and ACCEPT.
///
/// Layout:
/// ```text
/// [1 version][32 initiator pk][2 initiator port][32 responder pk][2 responder port]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Protocol version.
    pub version: u8,
    /// Dialing side.
    pub initiator: Addr,
    /// Dialed side; its port is the destination port.
    pub responder: Addr,
}

impl HandshakePayload {
    /// Payload for the current protocol version.
    pub fn new(initiator: Addr, responder: Addr) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            initiator,
            responder,
        }
    }

    /// Serialize to the fixed layout.
    pub fn encode(&self) -> [u8; HANDSHAKE_PAYLOAD_SIZE] {
        let mut buf = [0u8; HANDSHAKE_PAYLOAD_SIZE];
        buf[0] = self.version;
        let mut off = 1;
        for addr in [&self.initiator, &self.responder] {
            buf[off..off + PUBLIC_KEY_SIZE].copy_from_slice(addr.pk.as_bytes());
            off += PUBLIC_KEY_SIZE;
            buf[off..off + 2].copy_from_slice(&addr.port.to_be_bytes());
            off += 2;
        }
        buf
    }

    /// Parse the fixed layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != HANDSHAKE_PAYLOAD_SIZE {
            return Err(FrameError::InvalidHandshakeLength(bytes.len()));
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(bytes[0]));
        }

        let addr_at = |off: usize| {
            let mut pk = [0u8; PUBLIC_KEY_SIZE];
            pk.copy_from_slice(&bytes[off..off + PUBLIC_KEY_SIZE]);
            let port_off = off + PUBLIC_KEY_SIZE;
            let port = u16::from_be_bytes([bytes[port_off], bytes[port_off + 1]]);
            Addr::new(PubKey::from_bytes(pk), port)
        };

        Ok(Self {
            version: bytes[0],
            initiator: addr_at(1),
            responder: addr_at(1 + PUBLIC_KEY_SIZE + 2),
        })
    }
}
