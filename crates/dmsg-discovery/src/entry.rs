//! Discovery entries.

use crate::error::{DiscoveryError, EntryValidationError};
use crate::{ALLOWED_TIMESTAMP_ERROR, ENTRY_LIFETIME, ENTRY_VERSION};
use dmsg_crypto::{PublicKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix nanoseconds.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Client section of an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Relays this client is reachable through
    pub delegated_servers: Vec<PublicKey>,
}

/// Server section of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Public TCP address of the relay
    pub address: String,
    /// Number of sessions the relay can still accept
    pub available_sessions: i64,
}

/// A dmsg entity's record in discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Record format version
    pub version: String,
    /// Iteration sequence; strictly increases on every republish
    pub sequence: u64,
    /// Unix nanoseconds of this iteration
    pub timestamp: i64,
    /// Identity key of the entity
    #[serde(rename = "static")]
    pub static_pk: PublicKey,
    /// Present when advertised as a client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Present when advertised as a server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    /// Hex signature over the entry with this field empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Entry {
    /// Unsigned client entry
    #[must_use]
    pub fn new_client(pk: PublicKey, sequence: u64, delegated_servers: Vec<PublicKey>) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk: pk,
            client: Some(ClientInfo { delegated_servers }),
            server: None,
            signature: String::new(),
        }
    }

    /// Unsigned server entry
    #[must_use]
    pub fn new_server(pk: PublicKey, sequence: u64, address: String, available_sessions: i64) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk: pk,
            client: None,
            server: Some(ServerInfo {
                address,
                available_sessions,
            }),
            signature: String::new(),
        }
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        // Serializing plain strings, integers and hex keys cannot fail.
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    /// Sign the entry, replacing any previous signature.
    pub fn sign(&mut self, sk: &SecretKey) {
        self.signature.clear();
        let sig = sk.sign(&self.signing_bytes());
        self.signature = sig.to_string();
    }

    /// Check the signature against the entry's static key.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unauthorized`] if the signature is missing,
    /// malformed or does not verify.
    pub fn verify_signature(&self) -> Result<(), DiscoveryError> {
        let sig: Signature = self
            .signature
            .parse()
            .map_err(|_| DiscoveryError::Unauthorized)?;
        self.static_pk
            .verify(&self.signing_bytes(), &sig)
            .map_err(|_| DiscoveryError::Unauthorized)
    }

    /// Structural and freshness validation.
    ///
    /// # Errors
    ///
    /// Returns the first [`EntryValidationError`] that applies.
    pub fn validate(&self) -> Result<(), EntryValidationError> {
        if self.version.is_empty() {
            return Err(EntryValidationError::NoVersion);
        }
        if self.signature.is_empty() {
            return Err(EntryValidationError::NoSignature);
        }
        if self.static_pk.is_null() {
            return Err(EntryValidationError::NilKeys);
        }
        if self.client.is_none() && self.server.is_none() {
            return Err(EntryValidationError::NoClientOrServer);
        }
        if let Some(server) = &self.server {
            if server.address.is_empty() {
                return Err(EntryValidationError::EmptyServerAddress);
            }
        }

        let now = now_nanos();
        let earliest = now.saturating_sub(ENTRY_LIFETIME.as_nanos() as i64);
        let latest = now.saturating_add(ALLOWED_TIMESTAMP_ERROR.as_nanos() as i64);
        if self.timestamp < earliest || self.timestamp > latest {
            return Err(EntryValidationError::OutdatedTime);
        }
        Ok(())
    }

    /// Check that `next` is a valid successor of this entry.
    ///
    /// # Errors
    ///
    /// Returns [`EntryValidationError::WrongSequence`] or
    /// [`EntryValidationError::WrongTime`].
    pub fn validate_iteration(&self, next: &Entry) -> Result<(), EntryValidationError> {
        if next.sequence <= self.sequence {
            return Err(EntryValidationError::WrongSequence);
        }
        if next.timestamp < self.timestamp {
            return Err(EntryValidationError::WrongTime);
        }
        Ok(())
    }

    /// Delegated servers, if this is a client entry
    #[must_use]
    pub fn delegated_servers(&self) -> Option<&[PublicKey]> {
        self.client.as_ref().map(|c| c.delegated_servers.as_slice())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry(static={} seq={} ts={}",
            self.static_pk.short(),
            self.sequence,
            self.timestamp
        )?;
        if let Some(c) = &self.client {
            write!(f, " delegated={}", c.delegated_servers.len())?;
        }
        if let Some(s) = &self.server {
            write!(f, " addr={} available={}", s.address, s.available_sessions)?;
        }
        f.write_str(")")
    }
}
