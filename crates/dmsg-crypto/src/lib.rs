//! # dmsg Crypto
//!
//! Identity primitives for the dmsg relay protocol.
//!
//! Every dmsg entity (client or relay server) is identified by an Ed25519
//! public key. This crate provides:
//! - `PublicKey` / `SecretKey` / `Signature` wrappers with hex encodings
//! - Keypair generation from the OS RNG
//! - BLAKE3 hashing used to bind stream responses to their requests
//!
//! ## Usage
//!
//! ```
//! use dmsg_crypto::{generate_keypair, hash};
//!
//! let (pk, sk) = generate_keypair();
//! let sig = sk.sign(b"hello");
//! assert!(pk.verify(b"hello", &sig).is_ok());
//! assert_ne!(hash(b"a"), hash(b"b"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod keys;

pub use error::CryptoError;
pub use hash::{Hash, hash};
pub use keys::{PublicKey, SecretKey, Signature, generate_keypair};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// BLAKE3 output size
pub const HASH_SIZE: usize = 32;
