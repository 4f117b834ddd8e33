//! Peer addressing.

use std::fmt;

use crate::crypto::PubKey;

/// A dmsg endpoint: a peer's public key plus a logical port.
///
/// Ports are scoped to the peer; they have nothing to do with OS ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Peer identity.
    pub pk: PubKey,
    /// Logical port on that peer.
    pub port: u16,
}

impl Addr {
    /// Create an address.
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}
