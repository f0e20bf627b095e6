//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature does not authenticate the message
    #[error("invalid signature")]
    InvalidSignature,

    /// Bytes are not a valid Ed25519 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Hex decoding failed
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Decoded value has the wrong size
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}
