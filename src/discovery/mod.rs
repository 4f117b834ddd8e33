//! Peer discovery.
//!
//! Every peer publishes a signed [`Entry`]: clients list the relays they can
//! be reached through, relays list their public address. Updates use
//! optimistic concurrency on the entry's sequence number.

mod entry;
#[cfg(feature = "http")]
mod http;
mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use entry::{ENTRY_VERSION, Entry, Role, now_nanos};
#[cfg(feature = "http")]
pub use http::HttpDiscovery;
pub use mock::MockDiscovery;

use crate::core::MAX_UPDATE_ATTEMPTS;
use crate::crypto::{Keypair, PubKey};

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No entry for the requested key.
    #[error("entry not found")]
    EntryNotFound,

    /// Posted sequence is not the stored sequence plus one.
    #[error("wrong entry sequence")]
    WrongSequence,

    /// Entry signature does not verify.
    #[error("invalid entry signature")]
    InvalidSignature,

    /// Entry failed a structural check.
    #[error("invalid entry: {0}")]
    Validation(String),

    /// Any other error reported by the service.
    #[error("discovery service returned {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Message from the response body.
        message: String,
    },

    /// Request did not complete.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Body could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Whether retrying later may succeed.
    pub fn is_network(&self) -> bool {
        match self {
            #[cfg(feature = "http")]
            Self::Http(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Access to the discovery service.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Fetch the entry of `pk`.
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError>;

    /// Store a signed entry.
    async fn set_entry(&self, entry: &Entry) -> Result<(), DiscoveryError>;

    /// Entries of every known relay server.
    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError>;

    /// Bump, sign and store `entry`.
    ///
    /// On a sequence conflict the stored entry is fetched. If it is strictly
    /// newer it wins: `entry` adopts its sequence and the update is dropped.
    /// Otherwise the update is retried on top of the stored sequence.
    async fn update_entry(&self, keypair: &Keypair, entry: &mut Entry) -> Result<(), DiscoveryError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            entry.sequence = entry
                .sequence
                .checked_add(1)
                .ok_or_else(|| DiscoveryError::Validation("sequence exhausted".into()))?;
            let next_ts = entry
                .timestamp
                .checked_add(1)
                .ok_or_else(|| DiscoveryError::Validation("timestamp out of range".into()))?;
            entry.timestamp = now_nanos().max(next_ts);
            entry.sign(keypair)?;

            match self.set_entry(entry).await {
                Ok(()) => return Ok(()),
                Err(DiscoveryError::WrongSequence) => {
                    let remote = self.entry(&entry.static_pk).await?;
                    debug!(
                        local = entry.sequence,
                        remote = remote.sequence,
                        "entry sequence conflict"
                    );
                    entry.sequence = remote.sequence;
                    if remote.timestamp > entry.timestamp {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(DiscoveryError::WrongSequence)
    }

    /// Create or update the caller's own entry with `role`.
    async fn publish_entry(&self, keypair: &Keypair, role: Role) -> Result<Entry, DiscoveryError> {
        match self.entry(&keypair.public_key()).await {
            Ok(mut entry) => {
                entry.role = role;
                self.update_entry(keypair, &mut entry).await?;
                Ok(entry)
            }
            Err(DiscoveryError::EntryNotFound) => {
                let mut entry = Entry::new(keypair.public_key(), role);
                entry.sign(keypair)?;
                self.set_entry(&entry).await?;
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }
}
