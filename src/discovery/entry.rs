//! Signed discovery records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::DiscoveryError;
use crate::crypto::{Keypair, PubKey, Sig};

/// Entry format version.
pub const ENTRY_VERSION: &str = "0.0.1";

/// What a peer publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A client and the relays it is reachable through.
    Client {
        /// Servers the client keeps connections to.
        delegated_servers: Vec<PubKey>,
    },
    /// A relay server.
    Server {
        /// Public `host:port` of the relay.
        address: String,
    },
}

/// A discovery record.
///
/// Invariant: a valid entry's signature verifies against `static_pk` over the
/// JSON encoding of the entry with the signature left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Format version.
    pub version: String,
    /// Incremented by one on every update; a new entry starts at 0.
    pub sequence: u64,
    /// Unix time in nanoseconds of the last update.
    pub timestamp: i64,
    /// Owner of the entry.
    #[serde(rename = "static")]
    pub static_pk: PubKey,
    /// Client or server details.
    #[serde(flatten)]
    pub role: Role,
    /// Owner's signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Sig>,
}

/// Current unix time in nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

impl Entry {
    /// Unsigned entry with sequence 0.
    pub fn new(static_pk: PubKey, role: Role) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence: 0,
            timestamp: now_nanos(),
            static_pk,
            role,
            signature: None,
        }
    }

    /// Unsigned client entry.
    pub fn new_client(static_pk: PubKey, delegated_servers: Vec<PubKey>) -> Self {
        Self::new(static_pk, Role::Client { delegated_servers })
    }

    /// Unsigned server entry.
    pub fn new_server(static_pk: PubKey, address: impl Into<String>) -> Self {
        Self::new(
            static_pk,
            Role::Server {
                address: address.into(),
            },
        )
    }

    /// Servers a client entry delegates to. Empty for server entries.
    pub fn delegated_servers(&self) -> &[PubKey] {
        match &self.role {
            Role::Client { delegated_servers } => delegated_servers,
            Role::Server { .. } => &[],
        }
    }

    /// Address of a server entry.
    pub fn server_address(&self) -> Option<&str> {
        match &self.role {
            Role::Server { address } => Some(address),
            Role::Client { .. } => None,
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign with the owner's keypair.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), DiscoveryError> {
        if keypair.public_key() != self.static_pk {
            return Err(DiscoveryError::Validation(
                "signing key does not own the entry".into(),
            ));
        }
        let msg = self.signing_bytes()?;
        self.signature = Some(keypair.sign(&msg));
        Ok(())
    }

    /// Check the signature.
    pub fn verify(&self) -> Result<(), DiscoveryError> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| DiscoveryError::Validation("entry is not signed".into()))?;
        let msg = self.signing_bytes()?;
        self.static_pk
            .verify(&msg, sig)
            .map_err(|_| DiscoveryError::InvalidSignature)
    }

    /// Structural checks plus the signature.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.static_pk.is_null() {
            return Err(DiscoveryError::Validation("null static key".into()));
        }
        if let Role::Server { address } = &self.role {
            if address.is_empty() {
                return Err(DiscoveryError::Validation("empty server address".into()));
            }
        }
        self.verify()
    }
}
