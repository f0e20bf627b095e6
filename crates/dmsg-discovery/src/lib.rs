//! # dmsg Discovery
//!
//! Discovery layer for the dmsg relay protocol.
//!
//! The discovery service maps a public key to a signed [`Entry`] that
//! describes either a relay server (address and spare capacity) or a client
//! (the relays it can currently be reached through). This crate provides:
//! - The [`Entry`] record with signing, signature verification and validation
//! - The async [`DiscoveryClient`] API consumed by clients and servers
//! - [`MemoryDiscovery`], a process-local implementation enforcing the same
//!   sequence and signature rules as the deployed service
//!
//! ## Example
//!
//! ```rust,no_run
//! use dmsg_discovery::{DiscoveryClient, Entry, MemoryDiscovery};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let disc = MemoryDiscovery::new();
//! let (pk, sk) = dmsg_crypto::generate_keypair();
//!
//! let mut entry = Entry::new_server(pk, 0, "127.0.0.1:8080".to_string(), 10);
//! entry.sign(&sk);
//! disc.post_entry(&entry).await?;
//!
//! let servers = disc.available_servers().await?;
//! assert_eq!(servers.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod entry;
pub mod error;
pub mod memory;

pub use client::DiscoveryClient;
pub use entry::{ClientInfo, Entry, ServerInfo};
pub use error::{DiscoveryError, EntryValidationError};
pub use memory::MemoryDiscovery;

/// Current entry format version
pub const ENTRY_VERSION: &str = "0.0.1";

/// How long an entry's timestamp stays acceptable
pub const ENTRY_LIFETIME: std::time::Duration = std::time::Duration::from_secs(60);

/// Tolerated clock skew for entry timestamps in the future
pub const ALLOWED_TIMESTAMP_ERROR: std::time::Duration = std::time::Duration::from_millis(100);
