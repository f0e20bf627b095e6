//! Signed handshake objects.
//!
//! Control payloads are a [`SignedObject`]: a 64-byte Ed25519 signature
//! followed by the JSON encoding of the object it signs. Each object carries
//! [`HANDSHAKE_PAYLOAD_VERSION`] so incompatible peers fail fast.

use crate::HANDSHAKE_PAYLOAD_VERSION;
use crate::addr::Addr;
use crate::error::HandshakeError;
use dmsg_crypto::{Hash, PublicKey, SecretKey, Signature, SIGNATURE_SIZE, hash};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Signature followed by the signed JSON bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject(Vec<u8>);

impl SignedObject {
    /// Serialize and sign `obj`.
    pub fn sign<T: Serialize>(obj: &T, sk: &SecretKey) -> Result<Self, HandshakeError> {
        let body = serde_json::to_vec(obj).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let sig = sk.sign(&body);
        let mut bytes = Vec::with_capacity(SIGNATURE_SIZE + body.len());
        bytes.extend_from_slice(sig.as_bytes());
        bytes.extend_from_slice(&body);
        Ok(Self(bytes))
    }

    /// Wrap raw frame payload bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, HandshakeError> {
        if bytes.len() <= SIGNATURE_SIZE {
            return Err(HandshakeError::Malformed(format!(
                "signed object of {} bytes",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Raw bytes, as sent on the wire
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    fn body(&self) -> &[u8] {
        &self.0[SIGNATURE_SIZE..]
    }

    /// Whether the signature was made by `pk`
    #[must_use]
    pub fn is_signed_by(&self, pk: &PublicKey) -> bool {
        Signature::from_slice(&self.0[..SIGNATURE_SIZE])
            .and_then(|sig| pk.verify(self.body(), &sig))
            .is_ok()
    }

    /// Decode the signed object without checking the signature.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandshakeError> {
        serde_json::from_slice(self.body()).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    /// BLAKE3 hash of the full signed bytes
    #[must_use]
    pub fn hash(&self) -> Hash {
        hash(&self.0)
    }
}

fn check_version(got: &str) -> Result<(), HandshakeError> {
    if got != HANDSHAKE_PAYLOAD_VERSION {
        return Err(HandshakeError::VersionMismatch {
            expected: HANDSHAKE_PAYLOAD_VERSION,
            got: got.to_string(),
        });
    }
    Ok(())
}

/// Dial request, signed by the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Handshake payload version
    pub version: String,
    /// Unix nanoseconds; strictly increasing per session and source
    pub timestamp: i64,
    /// Dialing address
    pub src: Addr,
    /// Dialed address
    pub dst: Addr,
    /// Receive window of the dialer
    pub window: u32,
}

impl StreamRequest {
    /// New request at the current payload version
    #[must_use]
    pub fn new(src: Addr, dst: Addr, timestamp: i64, window: u32) -> Self {
        Self {
            version: HANDSHAKE_PAYLOAD_VERSION.to_string(),
            timestamp,
            src,
            dst,
            window,
        }
    }

    /// Decode and verify a signed request.
    ///
    /// Checks the version, the source and destination fields and the
    /// signature against `src.pk`. Timestamp ordering is the caller's job
    /// (see [`TimestampTracker`]).
    pub fn open(obj: &SignedObject) -> Result<Self, HandshakeError> {
        let req: Self = obj.decode()?;
        check_version(&req.version)?;
        if req.src.pk.is_null() {
            return Err(HandshakeError::InvalidSrcPk);
        }
        if req.dst.pk.is_null() {
            return Err(HandshakeError::InvalidDstPk);
        }
        if req.src.port == 0 {
            return Err(HandshakeError::InvalidSrcPort);
        }
        if req.dst.port == 0 {
            return Err(HandshakeError::InvalidDstPort);
        }
        if !obj.is_signed_by(&req.src.pk) {
            return Err(HandshakeError::InvalidSignature);
        }
        Ok(req)
    }
}

/// Dial acceptance, signed by the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResponse {
    /// Handshake payload version
    pub version: String,
    /// Hash of the signed request being accepted
    pub req_hash: Hash,
    /// Unix nanoseconds
    pub timestamp: i64,
    /// Receive window of the acceptor
    pub window: u32,
}

impl StreamResponse {
    /// New response to the request hashing to `req_hash`
    #[must_use]
    pub fn new(req_hash: Hash, timestamp: i64, window: u32) -> Self {
        Self {
            version: HANDSHAKE_PAYLOAD_VERSION.to_string(),
            req_hash,
            timestamp,
            window,
        }
    }

    /// Decode and verify a response to the request hashing to
    /// `expected_hash`, signed by `dst_pk`.
    pub fn open(
        obj: &SignedObject,
        expected_hash: &Hash,
        dst_pk: &PublicKey,
    ) -> Result<Self, HandshakeError> {
        let resp: Self = obj.decode()?;
        check_version(&resp.version)?;
        if resp.req_hash != *expected_hash {
            return Err(HandshakeError::RespInvalidHash);
        }
        if !obj.is_signed_by(dst_pk) {
            return Err(HandshakeError::RespInvalidSig);
        }
        Ok(resp)
    }
}

/// First message of a session, signed by the dialing entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHello {
    /// Handshake payload version
    pub version: String,
    /// Dialing entity
    pub initiator: PublicKey,
    /// Entity the dialer expects to reach
    pub responder: PublicKey,
    /// Unix nanoseconds
    pub timestamp: i64,
    /// Random value making every hello unique
    pub nonce: u64,
}

impl SessionHello {
    /// New hello with a random nonce
    #[must_use]
    pub fn new(initiator: PublicKey, responder: PublicKey, timestamp: i64) -> Self {
        Self {
            version: HANDSHAKE_PAYLOAD_VERSION.to_string(),
            initiator,
            responder,
            timestamp,
            nonce: rand::random(),
        }
    }

    /// Decode and verify a hello addressed to `local_pk`.
    pub fn open(obj: &SignedObject, local_pk: &PublicKey) -> Result<Self, HandshakeError> {
        let hello: Self = obj.decode()?;
        check_version(&hello.version)?;
        if hello.responder != *local_pk {
            return Err(HandshakeError::InvalidDstPk);
        }
        if hello.initiator.is_null() {
            return Err(HandshakeError::InvalidSrcPk);
        }
        if !obj.is_signed_by(&hello.initiator) {
            return Err(HandshakeError::InvalidSignature);
        }
        Ok(hello)
    }
}

/// Responder's answer to a [`SessionHello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHelloAck {
    /// Handshake payload version
    pub version: String,
    /// Hash of the signed hello
    pub hello_hash: Hash,
    /// Unix nanoseconds
    pub timestamp: i64,
}

impl SessionHelloAck {
    /// Acknowledge the hello hashing to `hello_hash`
    #[must_use]
    pub fn new(hello_hash: Hash, timestamp: i64) -> Self {
        Self {
            version: HANDSHAKE_PAYLOAD_VERSION.to_string(),
            hello_hash,
            timestamp,
        }
    }

    /// Decode and verify an ack from `responder` for our hello.
    pub fn open(
        obj: &SignedObject,
        hello_hash: &Hash,
        responder: &PublicKey,
    ) -> Result<Self, HandshakeError> {
        let ack: Self = obj.decode()?;
        check_version(&ack.version)?;
        if ack.hello_hash != *hello_hash {
            return Err(HandshakeError::RespInvalidHash);
        }
        if !obj.is_signed_by(responder) {
            return Err(HandshakeError::RespInvalidSig);
        }
        Ok(ack)
    }
}

/// Last request timestamp seen per source key.
#[derive(Debug, Default)]
pub struct TimestampTracker {
    last: HashMap<PublicKey, i64>,
}

impl TimestampTracker {
    /// Accept `timestamp` only if it is newer than the last from `pk`.
    pub fn check(&mut self, pk: PublicKey, timestamp: i64) -> Result<(), HandshakeError> {
        match self.last.get(&pk) {
            Some(&last) if timestamp <= last => Err(HandshakeError::InvalidTimestamp),
            _ => {
                self.last.insert(pk, timestamp);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmsg_crypto::generate_keypair;

    fn signed_request() -> (StreamRequest, SignedObject, SecretKey) {
        let (src, sk) = generate_keypair();
        let (dst, _) = generate_keypair();
        let req = StreamRequest::new(Addr::new(src, 49152), Addr::new(dst, 7), 10, 1024);
        let obj = SignedObject::sign(&req, &sk).unwrap();
        (req, obj, sk)
    }

    #[test]
    fn test_request_open() {
        let (req, obj, _) = signed_request();
        assert_eq!(StreamRequest::open(&obj).unwrap(), req);
    }

    #[test]
    fn test_request_tampered_signature() {
        let (_, obj, _) = signed_request();
        let mut bytes = obj.into_bytes();
        bytes[3] ^= 0xff;
        let tampered = SignedObject::from_bytes(bytes).unwrap();
        assert_eq!(
            StreamRequest::open(&tampered),
            Err(HandshakeError::InvalidSignature)
        );
    }

    #[test]
    fn test_request_signed_by_other_key() {
        let (req, _, _) = signed_request();
        let (_, other) = generate_keypair();
        let obj = SignedObject::sign(&req, &other).unwrap();
        assert_eq!(
            StreamRequest::open(&obj),
            Err(HandshakeError::InvalidSignature)
        );
    }

    #[test]
    fn test_request_field_checks() {
        let (mut req, _, sk) = signed_request();
        req.src.port = 0;
        let obj = SignedObject::sign(&req, &sk).unwrap();
        assert_eq!(StreamRequest::open(&obj), Err(HandshakeError::InvalidSrcPort));

        req.src.port = 1;
        req.dst.pk = PublicKey::NULL;
        let obj = SignedObject::sign(&req, &sk).unwrap();
        assert_eq!(StreamRequest::open(&obj), Err(HandshakeError::InvalidDstPk));

        req.version = "1.0".into();
        let obj = SignedObject::sign(&req, &sk).unwrap();
        assert!(matches!(
            StreamRequest::open(&obj),
            Err(HandshakeError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_short_object_rejected() {
        assert!(SignedObject::from_bytes(vec![0; SIGNATURE_SIZE]).is_err());
        let junk = SignedObject::from_bytes(vec![0; SIGNATURE_SIZE + 4]).unwrap();
        assert!(matches!(
            StreamRequest::open(&junk),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_binds_request() {
        let (req, req_obj, _) = signed_request();
        let (_, dst_sk) = generate_keypair();
        let dst_pk = dst_sk.public_key();
        let resp = StreamResponse::new(req_obj.hash(), 11, 4096);
        let obj = SignedObject::sign(&resp, &dst_sk).unwrap();
        assert_eq!(
            StreamResponse::open(&obj, &req_obj.hash(), &dst_pk).unwrap(),
            resp
        );

        let other = SignedObject::sign(&StreamRequest { timestamp: 99, ..req }, &dst_sk).unwrap();
        assert_eq!(
            StreamResponse::open(&obj, &other.hash(), &dst_pk),
            Err(HandshakeError::RespInvalidHash)
        );
        let (intruder, _) = generate_keypair();
        assert_eq!(
            StreamResponse::open(&obj, &req_obj.hash(), &intruder),
            Err(HandshakeError::RespInvalidSig)
        );
    }

    #[test]
    fn test_session_hello() {
        let (a, a_sk) = generate_keypair();
        let (b, b_sk) = generate_keypair();
        let hello = SignedObject::sign(&SessionHello::new(a, b, 1), &a_sk).unwrap();
        assert_eq!(SessionHello::open(&hello, &b).unwrap().initiator, a);
        assert_eq!(
            SessionHello::open(&hello, &a),
            Err(HandshakeError::InvalidDstPk)
        );

        let ack = SignedObject::sign(&SessionHelloAck::new(hello.hash(), 2), &b_sk).unwrap();
        assert!(SessionHelloAck::open(&ack, &hello.hash(), &b).is_ok());
        assert!(SessionHelloAck::open(&ack, &hello.hash(), &a).is_err());
    }

    #[test]
    fn test_timestamp_tracker() {
        let (a, _) = generate_keypair();
        let (b, _) = generate_keypair();
        let mut tracker = TimestampTracker::default();
        assert!(tracker.check(a, 5).is_ok());
        assert_eq!(tracker.check(a, 5), Err(HandshakeError::InvalidTimestamp));
        assert_eq!(tracker.check(a, 4), Err(HandshakeError::InvalidTimestamp));
        assert!(tracker.check(b, 1).is_ok());
        assert!(tracker.check(a, 6).is_ok());
    }
}
