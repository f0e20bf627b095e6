//! Process-local discovery.
//!
//! Applies the acceptance rules of the deployed discovery service. Entries
//! must validate and carry a valid signature. A key's first entry starts at
//! sequence zero and every republish advances it.

use crate::client::DiscoveryClient;
use crate::entry::Entry;
use crate::error::{DiscoveryError, EntryValidationError};
use async_trait::async_trait;
use dmsg_crypto::PublicKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-memory discovery service
#[derive(Debug, Default, Clone)]
pub struct MemoryDiscovery {
    entries: Arc<RwLock<HashMap<PublicKey, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDiscovery {
    /// Create an empty discovery
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`DiscoveryError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no entries are stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), DiscoveryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Unavailable("service offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn entry(&self, pk: &PublicKey) -> Result<Entry, DiscoveryError> {
        self.check_available()?;
        self.entries
            .read()
            .await
            .get(pk)
            .cloned()
            .ok_or(DiscoveryError::EntryNotFound)
    }

    async fn post_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        self.check_available()?;
        entry.validate()?;
        entry.verify_signature()?;

        let mut entries = self.entries.write().await;
        match entries.get(&entry.static_pk) {
            Some(current) => current.validate_iteration(entry)?,
            None if entry.sequence != 0 => {
                return Err(EntryValidationError::NonZeroSequence.into());
            }
            None => {}
        }
        entries.insert(entry.static_pk, entry.clone());
        Ok(())
    }

    async fn del_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        self.check_available()?;
        entry.verify_signature()?;
        self.entries
            .write()
            .await
            .remove(&entry.static_pk)
            .map(|_| ())
            .ok_or(DiscoveryError::EntryNotFound)
    }

    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError> {
        self.check_available()?;
        let mut servers: Vec<Entry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.server.as_ref().is_some_and(|s| s.available_sessions > 0))
            .cloned()
            .collect();
        servers.sort_by_key(|e| {
            std::cmp::Reverse(e.server.as_ref().map_or(0, |s| s.available_sessions))
        });
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_crypto::generate_keypair;

    #[tokio::test]
    async fn test_post_and_get() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&sk);
        disc.post_entry(&entry).await.unwrap();
        assert_eq!(disc.entry(&pk).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let disc = MemoryDiscovery::new();
        let (pk, _) = generate_keypair();
        assert_eq!(disc.entry(&pk).await, Err(DiscoveryError::EntryNotFound));
    }

    #[tokio::test]
    async fn test_first_entry_requires_zero_sequence() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 2, vec![]);
        entry.sign(&sk);
        assert_eq!(
            disc.post_entry(&entry).await,
            Err(EntryValidationError::NonZeroSequence.into())
        );
    }

    #[tokio::test]
    async fn test_unsigned_or_forged_rejected() {
        let disc = MemoryDiscovery::new();
        let (pk, _) = generate_keypair();
        let (_, other_sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&other_sk);
        assert_eq!(
            disc.post_entry(&entry).await,
            Err(DiscoveryError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_stale_sequence_conflicts() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&sk);
        disc.post_entry(&entry).await.unwrap();

        let err = disc.post_entry(&entry).await.unwrap_err();
        assert!(err.is_sequence_conflict());
    }

    #[tokio::test]
    async fn test_put_entry_increments_sequence() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let (relay, _) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&sk);
        disc.post_entry(&entry).await.unwrap();

        entry.client = Some(crate::ClientInfo {
            delegated_servers: vec![relay],
        });
        disc.put_entry(&sk, &mut entry).await.unwrap();
        disc.put_entry(&sk, &mut entry).await.unwrap();

        let stored = disc.entry(&pk).await.unwrap();
        assert_eq!(stored.sequence, 2);
        assert_eq!(stored.delegated_servers(), Some(&[relay][..]));
    }

    #[tokio::test]
    async fn test_put_entry_recovers_from_stale_local_copy() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&sk);
        disc.post_entry(&entry).await.unwrap();

        // Another writer advances the stored entry.
        let mut other = disc.entry(&pk).await.unwrap();
        disc.put_entry(&sk, &mut other).await.unwrap();
        disc.put_entry(&sk, &mut other).await.unwrap();

        // Older local copy at sequence 0 still publishes.
        let mut stale = entry.clone();
        disc.put_entry(&sk, &mut stale).await.unwrap();
        assert_eq!(stale.sequence, 3);
        assert_eq!(disc.entry(&pk).await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_available_servers_sorted_and_filtered() {
        let disc = MemoryDiscovery::new();
        for available in [3, 0, 9] {
            let (pk, sk) = generate_keypair();
            let mut e = Entry::new_server(pk, 0, "127.0.0.1:1".into(), available);
            e.sign(&sk);
            disc.post_entry(&e).await.unwrap();
        }
        let (cpk, csk) = generate_keypair();
        let mut c = Entry::new_client(cpk, 0, vec![]);
        c.sign(&csk);
        disc.post_entry(&c).await.unwrap();

        let servers = disc.available_servers().await.unwrap();
        let counts: Vec<i64> = servers
            .iter()
            .map(|e| e.server.as_ref().unwrap().available_sessions)
            .collect();
        assert_eq!(counts, vec![9, 3]);
    }

    #[tokio::test]
    async fn test_del_entry() {
        let disc = MemoryDiscovery::new();
        let (pk, sk) = generate_keypair();
        let mut entry = Entry::new_client(pk, 0, vec![]);
        entry.sign(&sk);
        disc.post_entry(&entry).await.unwrap();
        disc.del_entry(&entry).await.unwrap();
        assert!(disc.is_empty().await);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let disc = MemoryDiscovery::new();
        disc.set_unavailable(true);
        assert!(matches!(
            disc.available_servers().await,
            Err(DiscoveryError::Unavailable(_))
        ));
        disc.set_unavailable(false);
        assert!(disc.available_servers().await.unwrap().is_empty());
    }
}
