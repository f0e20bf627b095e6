//! Discovery API consumed by dmsg entities.

use crate::entry::{Entry, now_nanos};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use dmsg_crypto::{PublicKey, SecretKey};
use tracing::debug;

/// Async key-value API of the discovery service.
///
/// Implementations must be cheap to share behind an `Arc`; every dmsg
/// client and server receives its handle at construction time.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Fetch the entry stored for `pk`.
    async fn entry(&self, pk: &PublicKey) -> Result<Entry, DiscoveryError>;

    /// Store a signed entry. A stale sequence yields
    /// `Validation(WrongSequence)`.
    async fn post_entry(&self, entry: &Entry) -> Result<(), DiscoveryError>;

    /// Remove a signed entry.
    async fn del_entry(&self, entry: &Entry) -> Result<(), DiscoveryError>;

    /// Server entries that still have spare sessions.
    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError>;

    /// Publish an update of an existing entry.
    ///
    /// Increments the sequence, refreshes the timestamp, signs and posts.
    /// On a sequence conflict the stored entry is refetched: if it is newer
    /// than ours the update is dropped, otherwise the sequence is moved past
    /// it and the post is retried. Callers serialize their own publishes.
    async fn put_entry(&self, sk: &SecretKey, entry: &mut Entry) -> Result<(), DiscoveryError> {
        entry.sequence += 1;
        entry.timestamp = now_nanos();

        loop {
            entry.sign(sk);
            match self.post_entry(entry).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_sequence_conflict() => {
                    let remote = match self.entry(&entry.static_pk).await {
                        Ok(remote) => remote,
                        Err(_) => return Err(e),
                    };
                    if remote.timestamp > entry.timestamp {
                        debug!(
                            static_pk = %entry.static_pk,
                            remote_seq = remote.sequence,
                            "Stored entry is newer, dropping update"
                        );
                        entry.sequence = remote.sequence;
                        return Ok(());
                    }
                    entry.sequence = remote.sequence + 1;
                }
                Err(e) => {
                    entry.sequence -= 1;
                    return Err(e);
                }
            }
        }
    }
}
