//! # dmsg Core
//!
//! Core implementation of the dmsg relay protocol.
//!
//! Clients identified by public keys exchange byte streams through relay
//! servers they both hold a session with. This crate provides:
//! - Frame encoding and decoding
//! - Signed session and stream handshakes with replay protection
//! - Offset-acknowledged stream flow control
//! - The [`Client`] role: relay sessions, dialing, listeners, entry publishing
//! - The [`Server`] role: accepting sessions and relaying streams between them
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   session A    ┌────────────┐   session B    ┌──────────┐
//! │ Client X │◄──────────────►│   Relay R  │◄──────────────►│ Client Y │
//! │          │  stream id 2   │  link 2↔1  │  stream id 1   │          │
//! └──────────┘                └────────────┘                └──────────┘
//!       ▲                           ▲                             ▲
//!       └──────── entries in discovery (delegated relays, capacity) ┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use dmsg_core::{Addr, Client, ClientConfig};
//! use dmsg_discovery::MemoryDiscovery;
//! use std::sync::Arc;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example(remote: dmsg_crypto::PublicKey) -> Result<(), Box<dyn std::error::Error>> {
//! let (_, sk) = dmsg_crypto::generate_keypair();
//! let client = Client::new(sk, Arc::new(MemoryDiscovery::new()), ClientConfig::default())?;
//! tokio::spawn({
//!     let client = client.clone();
//!     async move { client.serve().await }
//! });
//! client.ready().await?;
//!
//! let mut stream = client.dial(Addr::new(remote, 7)).await?;
//! stream.write_all(b"hello").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod backoff;
pub mod client;
mod client_session;
pub mod config;
mod entity;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod server;
mod server_session;
pub mod session;
pub mod stream;
pub mod window;

pub use addr::Addr;
pub use backoff::Backoff;
pub use client::Client;
pub use client_session::ClientSession;
pub use config::{BackoffConfig, ClientConfig, ServerConfig};
pub use error::{Error, ErrorCode, FrameError, HandshakeError};
pub use frame::{Frame, FrameType};
pub use listener::Listener;
pub use server::Server;
pub use server_session::ServerSession;
pub use stream::{Stream, StreamInfo, StreamState};

use std::time::Duration;

/// Version string carried in every handshake object
pub const HANDSHAKE_PAYLOAD_VERSION: &str = "2.0";

/// Frame header: type (1), stream id (2), payload length (2)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest payload a frame can carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Default receive window of a stream, in bytes
pub const DEFAULT_WINDOW: u32 = 64 * 1024;

/// Default accept queue depth of a listener
pub const ACCEPT_BUFFER_SIZE: usize = 20;

/// Default stream dial timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default session establishment timeout
pub const SESSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of relay sessions a client keeps
pub const DEFAULT_MIN_SESSIONS: usize = 1;

/// Default relay session capacity
pub const DEFAULT_MAX_SESSIONS: usize = 2048;

/// Idle time before TCP keepalive starts checking a session connection
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Default entry refresh period; entries expire after one minute
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(30);
