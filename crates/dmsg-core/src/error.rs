//! Error types for the dmsg core protocol.
//!
//! Errors that can travel on the wire (as the reason of a CLOSE frame) carry
//! a stable numeric [`ErrorCode`]. Code `0` is a normal close.

use dmsg_crypto::PublicKey;
use dmsg_discovery::DiscoveryError;
use std::fmt;
use thiserror::Error;

/// Wire code of a dmsg error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    /// Normal close, no error
    pub const NORMAL: Self = Self(0);

    /// Whether this is the normal-close code
    #[must_use]
    pub fn is_normal(self) -> bool {
        self == Self::NORMAL
    }

    /// Reconstruct the error carried by a rejection.
    ///
    /// Unknown codes, and a rejection without a reason, surface as
    /// [`HandshakeError::RespNotAccepted`].
    #[must_use]
    pub fn into_error(self) -> Error {
        match self.0 {
            10 => Error::EntityClosed,
            11 => Error::SessionClosed,
            12 => Error::CannotConnectToDelegated,
            30 => Error::DiscEntryNotFound,
            31 => Error::DiscEntryIsNotServer,
            32 => Error::DiscEntryIsNotClient,
            33 => Error::DiscEntryHasNoDelegated,
            50 => HandshakeError::InvalidSignature.into(),
            51 => HandshakeError::InvalidTimestamp.into(),
            52 => HandshakeError::InvalidSrcPk.into(),
            53 => HandshakeError::InvalidDstPk.into(),
            54 => HandshakeError::InvalidSrcPort.into(),
            55 => HandshakeError::InvalidDstPort.into(),
            56 => HandshakeError::NoListener.into(),
            57 => HandshakeError::NoSession.into(),
            60 => HandshakeError::RespInvalidSig.into(),
            61 => HandshakeError::RespInvalidHash.into(),
            80 => Error::PortOccupied,
            81 => Error::AcceptChanMaxed,
            _ => HandshakeError::RespNotAccepted.into(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}", self.0)
    }
}

/// Core dmsg errors
#[derive(Debug, Error)]
pub enum Error {
    /// The client or server has been closed
    #[error("local entity closed")]
    EntityClosed,

    /// The session carrying the operation is gone
    #[error("local session closed")]
    SessionClosed,

    /// None of the remote's delegated servers could be reached
    #[error("cannot connect to delegated server")]
    CannotConnectToDelegated,

    /// Session establishment failed
    #[error("session handshake failed: {0}")]
    SessionHandshake(String),

    /// Remote has no discovery entry
    #[error("discovery entry is not found")]
    DiscEntryNotFound,

    /// Entry does not describe a server
    #[error("discovery entry is not of server")]
    DiscEntryIsNotServer,

    /// Entry does not describe a client
    #[error("discovery entry is not of client")]
    DiscEntryIsNotClient,

    /// Client entry lists no delegated servers
    #[error("discovery client entry has no delegated servers")]
    DiscEntryHasNoDelegated,

    /// Other discovery failure
    #[error("discovery error: {0}")]
    Discovery(DiscoveryError),

    /// Stream handshake failure, local or reported by the peer
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A listener already holds the port
    #[error("port already occupied")]
    PortOccupied,

    /// Listener accept queue is full
    #[error("listener accept chan maxed")]
    AcceptChanMaxed,

    /// Listener is closed
    #[error("listener closed")]
    ListenerClosed,

    /// No ephemeral port or stream id is left
    #[error("no free {0} available")]
    Exhausted(&'static str),

    /// A session to this peer already exists
    #[error("session to {} already exists", .0.short())]
    DuplicateSession(PublicKey),

    /// Address string could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// Peer broke the protocol; fatal to the session
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Frame decoding error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Operation did not complete in time
    #[error("operation timed out")]
    Timeout,

    /// Configuration value out of range
    #[error("invalid config: {0}")]
    Config(String),

    /// Underlying transport error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire code, or [`ErrorCode::NORMAL`] for local-only errors
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EntityClosed => ErrorCode(10),
            Self::SessionClosed => ErrorCode(11),
            Self::CannotConnectToDelegated => ErrorCode(12),
            Self::SessionHandshake(_) => ErrorCode(13),
            Self::DiscEntryNotFound => ErrorCode(30),
            Self::DiscEntryIsNotServer => ErrorCode(31),
            Self::DiscEntryIsNotClient => ErrorCode(32),
            Self::DiscEntryHasNoDelegated => ErrorCode(33),
            Self::Handshake(e) => e.code(),
            Self::PortOccupied => ErrorCode(80),
            Self::AcceptChanMaxed => ErrorCode(81),
            _ => ErrorCode::NORMAL,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<DiscoveryError> for Error {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::EntryNotFound => Self::DiscEntryNotFound,
            other => Self::Discovery(other),
        }
    }
}

/// Stream handshake errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request signature does not verify
    #[error("request has invalid signature")]
    InvalidSignature,

    /// Request timestamp is not newer than the previous one
    #[error("request timestamp should be higher than last")]
    InvalidTimestamp,

    /// Request source key is null or does not match the session
    #[error("request has invalid source public key")]
    InvalidSrcPk,

    /// Request destination key is null or not ours
    #[error("request has invalid destination public key")]
    InvalidDstPk,

    /// Request source port is zero
    #[error("request has invalid source port")]
    InvalidSrcPort,

    /// Request destination port is zero
    #[error("request has invalid destination port")]
    InvalidDstPort,

    /// Nothing listens on the destination port
    #[error("request has no associated listener")]
    NoListener,

    /// Relay has no session to the destination
    #[error("request has no associated session on the dmsg server")]
    NoSession,

    /// Response signature does not verify
    #[error("response has invalid signature")]
    RespInvalidSig,

    /// Response does not reference our request
    #[error("response has invalid hash of associated request")]
    RespInvalidHash,

    /// Peer rejected without a known reason
    #[error("response rejected associated request without reason")]
    RespNotAccepted,

    /// Handshake payload version differs
    #[error("handshake version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version
        expected: &'static str,
        /// Peer's version
        got: String,
    },

    /// Payload could not be decoded
    #[error("malformed handshake payload: {0}")]
    Malformed(String),
}

impl HandshakeError {
    /// Wire code of this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSignature => ErrorCode(50),
            Self::InvalidTimestamp => ErrorCode(51),
            Self::InvalidSrcPk => ErrorCode(52),
            Self::InvalidDstPk => ErrorCode(53),
            Self::InvalidSrcPort => ErrorCode(54),
            Self::InvalidDstPort => ErrorCode(55),
            Self::NoListener => ErrorCode(56),
            Self::NoSession => ErrorCode(57),
            Self::RespInvalidSig => ErrorCode(60),
            Self::RespInvalidHash => ErrorCode(61),
            Self::RespNotAccepted => ErrorCode(62),
            Self::VersionMismatch { .. } | Self::Malformed(_) => ErrorCode::NORMAL,
        }
    }
}

/// Frame-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer shorter than the frame it announces
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown frame type byte
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Payload does not fit the 16-bit length field
    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadOverflow(usize),

    /// Control payload has the wrong size
    #[error("invalid {kind} payload length {len}")]
    InvalidPayload {
        /// Frame kind
        kind: &'static str,
        /// Received length
        len: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip_through_into_error() {
        let errors: Vec<Error> = vec![
            Error::SessionClosed,
            Error::CannotConnectToDelegated,
            Error::DiscEntryIsNotClient,
            HandshakeError::InvalidSignature.into(),
            HandshakeError::InvalidTimestamp.into(),
            HandshakeError::NoListener.into(),
            HandshakeError::NoSession.into(),
            HandshakeError::RespInvalidHash.into(),
            Error::PortOccupied,
            Error::AcceptChanMaxed,
        ];
        for e in errors {
            let code = e.code();
            assert!(!code.is_normal(), "{e} has no code");
            assert_eq!(code.into_error().code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_not_accepted() {
        assert!(matches!(
            ErrorCode(0).into_error(),
            Error::Handshake(HandshakeError::RespNotAccepted)
        ));
        assert!(matches!(
            ErrorCode(200).into_error(),
            Error::Handshake(HandshakeError::RespNotAccepted)
        ));
    }

    #[test]
    fn test_discovery_not_found_maps_to_dmsg_error() {
        assert!(matches!(
            Error::from(DiscoveryError::EntryNotFound),
            Error::DiscEntryNotFound
        ));
        assert!(matches!(
            Error::from(DiscoveryError::Unauthorized),
            Error::Discovery(_)
        ));
    }
}
