//! Discovery error types.

use thiserror::Error;

/// Errors returned by discovery operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// No entry is stored for the public key
    #[error("entry of public key is not found")]
    EntryNotFound,

    /// Entry signature does not verify against its static key
    #[error("invalid signature")]
    Unauthorized,

    /// Entry failed validation
    #[error("entry validation error: {0}")]
    Validation(#[from] EntryValidationError),

    /// Service could not be reached or answered unexpectedly
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

impl DiscoveryError {
    /// Whether a retry with a refetched entry may succeed
    #[must_use]
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, Self::Validation(EntryValidationError::WrongSequence))
    }
}

/// Reasons an entry is rejected by validation
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EntryValidationError {
    /// Entry has no version
    #[error("entry has no version")]
    NoVersion,

    /// Entry has no signature
    #[error("entry has no signature")]
    NoSignature,

    /// Static key is the null key
    #[error("entry Keys is nil")]
    NilKeys,

    /// Entry has neither client nor server section
    #[error("entry has neither client or server field")]
    NoClientOrServer,

    /// Server entry has an empty address
    #[error("server address cannot be empty")]
    EmptyServerAddress,

    /// Timestamp is outside the accepted lifetime window
    #[error("advertised entry has outdated timestamp")]
    OutdatedTime,

    /// First entry for a key must have sequence zero
    #[error("new entry has non-zero sequence")]
    NonZeroSequence,

    /// Sequence does not advance past the stored entry
    #[error("sequence field of new entry is not sequence of old entry + 1")]
    WrongSequence,

    /// Timestamp is older than the stored entry
    #[error("advertised entry timestamp is not greater than previous")]
    WrongTime,
}
