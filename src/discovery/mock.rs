//! In-memory discovery with the service's validation rules.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Discovery, DiscoveryError, Entry};
use crate::crypto::PubKey;

/// Discovery backed by a map, for tests and single-process setups.
///
/// Stored entries must be signed by their owner, a new entry must have
/// sequence 0, an update must carry the stored sequence plus one and a
/// newer timestamp.
#[derive(Debug, Default)]
pub struct MockDiscovery {
    entries: Mutex<HashMap<PubKey, Entry>>,
}

impl MockDiscovery {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PubKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `entry` without validation.
    pub fn seed(&self, entry: Entry) {
        self.entries().insert(entry.static_pk, entry);
    }

    /// Drop the entry of `pk`.
    pub fn remove(&self, pk: &PubKey) -> Option<Entry> {
        self.entries().remove(pk)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        self.entries()
            .get(pk)
            .cloned()
            .ok_or(DiscoveryError::EntryNotFound)
    }

    async fn set_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        entry.validate()?;

        let mut entries = self.entries();
        match entries.get(&entry.static_pk) {
            None if entry.sequence != 0 => return Err(DiscoveryError::WrongSequence),
            Some(old) if entry.sequence != old.sequence + 1 => {
                return Err(DiscoveryError::WrongSequence);
            }
            Some(old) if entry.timestamp <= old.timestamp => {
                return Err(DiscoveryError::Validation(
                    "timestamp is not newer than the stored one".into(),
                ));
            }
            _ => {}
        }
        entries.insert(entry.static_pk, entry.clone());
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError> {
        Ok(self
            .entries()
            .values()
            .filter(|e| e.server_address().is_some())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[tokio::test]
    async fn test_new_entry_rules() {
        let disc = MockDiscovery::new();
        let kp = Keypair::generate();

        let unsigned = Entry::new_client(kp.public_key(), Vec::new());
        assert!(disc.set_entry(&unsigned).await.is_err());

        let mut wrong_seq = unsigned.clone();
        wrong_seq.sequence = 3;
        wrong_seq.sign(&kp).unwrap();
        assert!(matches!(
            disc.set_entry(&wrong_seq).await,
            Err(DiscoveryError::WrongSequence)
        ));

        let mut entry = unsigned;
        entry.sign(&kp).unwrap();
        disc.set_entry(&entry).await.unwrap();
        assert_eq!(disc.entry(&kp.public_key()).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_update_rules() {
        let disc = MockDiscovery::new();
        let kp = Keypair::generate();
        let mut entry = Entry::new_client(kp.public_key(), Vec::new());
        entry.sign(&kp).unwrap();
        disc.set_entry(&entry).await.unwrap();

        // Same sequence again.
        assert!(matches!(
            disc.set_entry(&entry).await,
            Err(DiscoveryError::WrongSequence)
        ));

        let mut stale = entry.clone();
        stale.sequence = 1;
        stale.timestamp = entry.timestamp;
        stale.sign(&kp).unwrap();
        assert!(matches!(
            disc.set_entry(&stale).await,
            Err(DiscoveryError::Validation(_))
        ));

        let mut next = entry.clone();
        next.sequence = 1;
        next.timestamp = entry.timestamp + 1;
        next.sign(&kp).unwrap();
        disc.set_entry(&next).await.unwrap();
    }

    #[tokio::test]
    async fn test_forged_entry_rejected() {
        let disc = MockDiscovery::new();
        let victim = Keypair::generate();
        let mut forged = Entry::new_client(victim.public_key(), Vec::new());
        forged.signature = Some(Keypair::generate().sign(b"anything"));
        assert!(matches!(
            disc.set_entry(&forged).await,
            Err(DiscoveryError::InvalidSignature)
        ));
        assert!(disc.is_empty());
    }

    #[tokio::test]
    async fn test_available_servers() {
        let disc = MockDiscovery::new();
        let srv = Keypair::generate();
        let cli = Keypair::generate();

        let mut s = Entry::new_server(srv.public_key(), "127.0.0.1:9000");
        s.sign(&srv).unwrap();
        disc.set_entry(&s).await.unwrap();
        let mut c = Entry::new_client(cli.public_key(), vec![srv.public_key()]);
        c.sign(&cli).unwrap();
        disc.set_entry(&c).await.unwrap();

        let servers = disc.available_servers().await.unwrap();
        assert_eq!(servers, vec![s]);
        assert_eq!(disc.len(), 2);
    }
}
