//! Client end of a session with a relay.
//!
//! Streams dialed from this side use even ids; the relay allocates odd ids
//! for streams it delivers to us.

use crate::addr::Addr;
use crate::error::{Error, ErrorCode, HandshakeError};
use crate::frame::{Frame, FrameType};
use crate::handshake::{SignedObject, StreamRequest, StreamResponse, TimestampTracker};
use crate::listener::PortManager;
use crate::session::{Connection, FrameHandler, SessionCommon};
use crate::stream::{Stream, StreamInfo, StreamShared};
use dmsg_crypto::{Hash, PublicKey, SecretKey};
use dmsg_discovery::entry::now_nanos;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct PendingDial {
    req_hash: Hash,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    pending: Option<PendingDial>,
}

struct StreamTable {
    entries: HashMap<u16, StreamEntry>,
    next_id: u16,
    remote_ts: TimestampTracker,
    last_dial_ts: i64,
    closed: bool,
}

impl StreamTable {
    fn alloc_id(&mut self) -> Result<u16, Error> {
        for _ in 0..(u16::MAX / 2) {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(2) {
                0 => 2,
                next => next,
            };
            if !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Exhausted("stream id"))
    }
}

/// A live session from a client to one relay server.
pub struct ClientSession {
    common: SessionCommon,
    sk: SecretKey,
    ports: Arc<PortManager>,
    local_window: u32,
    relay_addr: Option<SocketAddr>,
    streams: Mutex<StreamTable>,
}

impl ClientSession {
    /// Wrap a handshaken connection and start its tasks.
    pub(crate) fn start<C: Connection>(
        conn: C,
        relay_addr: Option<SocketAddr>,
        sk: SecretKey,
        remote_pk: PublicKey,
        ports: Arc<PortManager>,
        local_window: u32,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            common: SessionCommon::new(sk.public_key(), remote_pk, cancel),
            sk,
            ports,
            local_window,
            relay_addr,
            streams: Mutex::new(StreamTable {
                entries: HashMap::new(),
                next_id: 2,
                remote_ts: TimestampTracker::default(),
                last_dial_ts: 0,
                closed: false,
            }),
        });
        session.common.start(conn, session.clone());
        session
    }

    /// Network address of the relay, when the session runs over TCP
    #[must_use]
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_addr
    }

    pub(crate) fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Relay server this session is connected to
    #[must_use]
    pub fn remote_pk(&self) -> PublicKey {
        self.common.remote_pk()
    }

    /// Number of registered streams, including closing ones
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Open streams carried by this session
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.table()
            .entries
            .values()
            .filter(|e| e.pending.is_none() && !e.shared.is_tombstone())
            .map(|e| e.shared.info())
            .collect()
    }

    /// Whether the session has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.common.is_closed()
    }

    /// Tear the session down and wait for its tasks.
    pub async fn close(&self) {
        self.common.close();
        self.common.closed().await;
    }

    /// Dial `dst` through this relay.
    ///
    /// Dropping the future or hitting `timeout` cancels the dial; a late
    /// ACCEPT is then discarded.
    pub(crate) async fn dial(&self, dst: Addr, timeout: Duration) -> Result<Stream, Error> {
        let port = self.ports.reserve_ephemeral()?;
        let src = Addr::new(self.common.local_pk(), port.port());
        let (reply_tx, reply_rx) = oneshot::channel();

        let (shared, sent) = {
            let mut table = self.table();
            if table.closed {
                return Err(Error::SessionClosed);
            }
            let id = table.alloc_id()?;
            let timestamp = now_nanos().max(table.last_dial_ts + 1);
            table.last_dial_ts = timestamp;

            let req = StreamRequest::new(src, dst, timestamp, self.local_window);
            let obj = SignedObject::sign(&req, &self.sk)?;
            let shared = StreamShared::new(
                id,
                src,
                dst,
                self.remote_pk(),
                self.local_window,
                self.common.sender(),
                Some(port),
            );
            table.entries.insert(
                id,
                StreamEntry {
                    shared: shared.clone(),
                    pending: Some(PendingDial {
                        req_hash: obj.hash(),
                        reply: reply_tx,
                    }),
                },
            );
            // Queued under the lock so requests leave in timestamp order.
            let sent = Frame::new(FrameType::Request, id, obj.into_bytes())
                .map_err(Error::from)
                .and_then(|frame| self.common.send(frame));
            (shared, sent)
        };

        let guard = DialGuard(Some(shared.clone()));
        sent?;
        debug!(stream_id = shared.id(), remote = %dst.short(), relay = %self.remote_pk().short(), "Dialing stream");

        let outcome = match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Ok(Ok(outcome)) => outcome,
        };
        match outcome {
            Ok(()) => {
                guard.disarm();
                Ok(Stream::new(shared))
            }
            Err(e) => Err(e),
        }
    }

    fn lookup(&self, id: u16, kind: FrameType) -> Result<Arc<StreamShared>, Error> {
        self.table()
            .entries
            .get(&id)
            .map(|e| e.shared.clone())
            .ok_or_else(|| Error::protocol(format!("{kind} for unknown stream {id}")))
    }

    fn reject(&self, id: u16, err: &Error) {
        debug!(stream_id = id, relay = %self.remote_pk().short(), error = %err, "Rejecting stream request");
        let _ = self.common.send(Frame::close(id, err.code()));
    }

    fn handle_request(&self, id: u16, payload: Vec<u8>) -> Result<(), Error> {
        if self.table().entries.contains_key(&id) {
            return Err(Error::protocol(format!("request reuses stream {id}")));
        }
        match self.accept_request(id, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reject(id, &e);
                Ok(())
            }
        }
    }

    fn accept_request(&self, id: u16, payload: Vec<u8>) -> Result<(), Error> {
        let obj = SignedObject::from_bytes(payload)?;
        let req = StreamRequest::open(&obj)?;
        if req.dst.pk != self.common.local_pk() {
            return Err(HandshakeError::InvalidDstPk.into());
        }
        self.table().remote_ts.check(req.src.pk, req.timestamp)?;

        let listener = self
            .ports
            .listener(req.dst.port)
            .ok_or(HandshakeError::NoListener)?;
        let permit = listener.try_reserve().map_err(no_listener_if_closed)?;

        let resp = StreamResponse::new(obj.hash(), now_nanos(), self.local_window);
        let resp = SignedObject::sign(&resp, &self.sk)?;
        let accept = Frame::new(FrameType::Accept, id, resp.into_bytes())?;

        listener
            .enqueue(permit, || {
                let shared = StreamShared::new(
                    id,
                    req.dst,
                    req.src,
                    self.remote_pk(),
                    self.local_window,
                    self.common.sender(),
                    None,
                );
                shared.open(req.window);
                {
                    let mut table = self.table();
                    if table.closed {
                        return Err(Error::SessionClosed);
                    }
                    table.entries.insert(
                        id,
                        StreamEntry {
                            shared: shared.clone(),
                            pending: None,
                        },
                    );
                }
                self.common.send(accept)?;
                Ok(Stream::new(shared))
            })
            .map_err(no_listener_if_closed)?;
        debug!(stream_id = id, remote = %req.src.short(), local = %req.dst.short(), "Accepted stream");
        Ok(())
    }

    fn handle_accept(&self, id: u16, payload: Vec<u8>) -> Result<(), Error> {
        let (shared, pending) = {
            let mut table = self.table();
            let entry = table
                .entries
                .get_mut(&id)
                .ok_or_else(|| Error::protocol(format!("ACCEPT for unknown stream {id}")))?;
            if entry.shared.is_tombstone() {
                debug!(stream_id = id, "Discarding late accept");
                return Ok(());
            }
            let pending = entry
                .pending
                .take()
                .ok_or_else(|| Error::protocol(format!("duplicate ACCEPT on stream {id}")))?;
            (entry.shared.clone(), pending)
        };

        let verified = SignedObject::from_bytes(payload).and_then(|obj| {
            StreamResponse::open(&obj, &pending.req_hash, &shared.remote().pk)
        });
        match verified {
            Ok(resp) => {
                shared.open(resp.window);
                if pending.reply.send(Ok(())).is_err() {
                    // Dialer gave up between the check above and now.
                    shared.close_local(ErrorCode::NORMAL);
                }
            }
            Err(e) => {
                warn!(stream_id = id, error = %e, "Invalid dial response");
                shared.close_local(ErrorCode::NORMAL);
                let _ = pending.reply.send(Err(e.into()));
            }
        }
        Ok(())
    }

    fn handle_close(&self, id: u16, code: ErrorCode) {
        let mut table = self.table();
        let Some(entry) = table.entries.get_mut(&id) else {
            debug!(stream_id = id, "Close for unknown stream");
            return;
        };

        if entry.shared.is_tombstone() {
            table.entries.remove(&id);
            return;
        }
        if let Some(pending) = entry.pending.take() {
            if let Some(entry) = table.entries.remove(&id) {
                entry.shared.on_remote_close();
            }
            drop(table);
            let _ = pending.reply.send(Err(code.into_error()));
            return;
        }
        if let Some(entry) = table.entries.remove(&id) {
            drop(table);
            if entry.shared.on_remote_close() {
                let _ = self.common.send(Frame::close(id, ErrorCode::NORMAL));
            }
            debug!(stream_id = id, remote = %entry.shared.remote().short(), "Stream closed by peer");
        }
    }
}

impl FrameHandler for ClientSession {
    fn handle_frame(&self, frame: Frame) -> Result<(), Error> {
        let id = frame.stream_id();
        match frame.frame_type() {
            FrameType::Ok => Err(Error::protocol("OK frame after session handshake")),
            FrameType::Request => self.handle_request(id, frame.into_payload()),
            FrameType::Accept => self.handle_accept(id, frame.into_payload()),
            FrameType::Close => {
                let code = frame.close_code()?;
                self.handle_close(id, code);
                Ok(())
            }
            FrameType::Fwd => self
                .lookup(id, FrameType::Fwd)?
                .on_fwd(frame.into_payload()),
            FrameType::Ack => {
                let offset = frame.ack_offset()?;
                self.lookup(id, FrameType::Ack)?.on_ack(offset)
            }
        }
    }

    fn on_teardown(&self) {
        let entries: Vec<StreamEntry> = {
            let mut table = self.table();
            table.closed = true;
            table.entries.drain().map(|(_, e)| e).collect()
        };
        debug!(relay = %self.remote_pk().short(), streams = entries.len(), "Client session closed");
        for entry in entries {
            entry.shared.teardown();
            if let Some(pending) = entry.pending {
                let _ = pending.reply.send(Err(Error::SessionClosed));
            }
        }
    }
}

/// A listener that closed under a racing request has no listener left.
fn no_listener_if_closed(e: Error) -> Error {
    match e {
        Error::ListenerClosed => HandshakeError::NoListener.into(),
        other => other,
    }
}

/// Cancels an in-flight dial unless disarmed.
struct DialGuard(Option<Arc<StreamShared>>);

impl DialGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            shared.close_local(ErrorCode::NORMAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame};
    use crate::session::{initiate, respond};
    use dmsg_crypto::generate_keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Harness {
        session: Arc<ClientSession>,
        ports: Arc<PortManager>,
        relay: DuplexStream,
        client_pk: PublicKey,
    }

    async fn harness(local_window: u32) -> Harness {
        let (client_pk, client_sk) = generate_keypair();
        let (relay_pk, relay_sk) = generate_keypair();
        let (mut client_io, mut relay) = tokio::io::duplex(1 << 20);

        let relay_side = tokio::spawn(async move {
            respond(&mut relay, &relay_sk).await.unwrap();
            relay
        });
        initiate(&mut client_io, &client_sk, relay_pk).await.unwrap();
        let relay = relay_side.await.unwrap();

        let ports = PortManager::new();
        let session = ClientSession::start(
            client_io,
            None,
            client_sk,
            relay_pk,
            ports.clone(),
            local_window,
            CancellationToken::new(),
        );
        Harness {
            session,
            ports,
            relay,
            client_pk,
        }
    }

    fn request_frame(id: u16, dst: Addr, timestamp: i64, sk: &SecretKey) -> Frame {
        let src = Addr::new(sk.public_key(), 49152);
        let req = StreamRequest::new(src, dst, timestamp, 1024);
        let obj = SignedObject::sign(&req, sk).unwrap();
        Frame::new(FrameType::Request, id, obj.into_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_request_accepted() {
        let mut h = harness(1024).await;
        let listener = h.ports.listen(Addr::new(h.client_pk, 7), 4).unwrap();
        let (_, dialer_sk) = generate_keypair();

        let req = request_frame(1, Addr::new(h.client_pk, 7), 1, &dialer_sk);
        write_frame(&mut h.relay, &req).await.unwrap();

        let accept = read_frame(&mut h.relay).await.unwrap();
        assert_eq!(accept.frame_type(), FrameType::Accept);
        assert_eq!(accept.stream_id(), 1);

        let mut stream = listener.accept().await.unwrap();
        assert_eq!(stream.remote_addr().pk, dialer_sk.public_key());
        assert_eq!(stream.server_pk(), h.session.remote_pk());

        write_frame(&mut h.relay, &Frame::fwd(1, b"ping").unwrap()).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        let ack = read_frame(&mut h.relay).await.unwrap();
        assert_eq!(ack.ack_offset().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_tampered_request_rejected() {
        let mut h = harness(1024).await;
        let listener = h.ports.listen(Addr::new(h.client_pk, 7), 4).unwrap();
        let (_, dialer_sk) = generate_keypair();

        let req = request_frame(1, Addr::new(h.client_pk, 7), 1, &dialer_sk);
        let mut payload = req.into_payload();
        payload[0] ^= 0x55;
        let tampered = Frame::new(FrameType::Request, 1, payload).unwrap();
        write_frame(&mut h.relay, &tampered).await.unwrap();

        let close = read_frame(&mut h.relay).await.unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);
        assert_eq!(
            close.close_code().unwrap(),
            HandshakeError::InvalidSignature.code()
        );
        assert_eq!(h.session.stream_count(), 0);
        let pending = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let mut h = harness(1024).await;
        let _listener = h.ports.listen(Addr::new(h.client_pk, 7), 4).unwrap();
        let (_, dialer_sk) = generate_keypair();
        let dst = Addr::new(h.client_pk, 7);

        write_frame(&mut h.relay, &request_frame(1, dst, 100, &dialer_sk)).await.unwrap();
        assert_eq!(read_frame(&mut h.relay).await.unwrap().frame_type(), FrameType::Accept);

        for (id, ts) in [(3, 100), (5, 99)] {
            write_frame(&mut h.relay, &request_frame(id, dst, ts, &dialer_sk)).await.unwrap();
            let close = read_frame(&mut h.relay).await.unwrap();
            assert_eq!(close.frame_type(), FrameType::Close);
            assert_eq!(close.stream_id(), id);
            assert_eq!(
                close.close_code().unwrap(),
                HandshakeError::InvalidTimestamp.code()
            );
        }
        assert_eq!(h.session.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_no_listener_and_full_queue() {
        let mut h = harness(1024).await;
        let (_, dialer_sk) = generate_keypair();

        write_frame(&mut h.relay, &request_frame(1, Addr::new(h.client_pk, 9), 1, &dialer_sk))
            .await
            .unwrap();
        let close = read_frame(&mut h.relay).await.unwrap();
        assert_eq!(close.close_code().unwrap(), HandshakeError::NoListener.code());

        let _listener = h.ports.listen(Addr::new(h.client_pk, 9), 1).unwrap();
        write_frame(&mut h.relay, &request_frame(3, Addr::new(h.client_pk, 9), 2, &dialer_sk))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut h.relay).await.unwrap().frame_type(), FrameType::Accept);
        write_frame(&mut h.relay, &request_frame(5, Addr::new(h.client_pk, 9), 3, &dialer_sk))
            .await
            .unwrap();
        let close = read_frame(&mut h.relay).await.unwrap();
        assert_eq!(close.close_code().unwrap(), Error::AcceptChanMaxed.code());
    }

    #[tokio::test]
    async fn test_unknown_stream_tears_down_session() {
        let mut h = harness(1024).await;
        write_frame(&mut h.relay, &Frame::fwd(42, b"junk").unwrap()).await.unwrap();
        h.session.common().closed().await;
        assert!(h.session.is_closed());
        let mut rest = Vec::new();
        let _ = h.relay.read_to_end(&mut rest).await;
    }

    #[tokio::test]
    async fn test_window_overrun_tears_down_session() {
        let mut h = harness(8).await;
        let listener = h.ports.listen(Addr::new(h.client_pk, 7), 4).unwrap();
        let (_, dialer_sk) = generate_keypair();
        write_frame(&mut h.relay, &request_frame(1, Addr::new(h.client_pk, 7), 1, &dialer_sk))
            .await
            .unwrap();
        read_frame(&mut h.relay).await.unwrap();
        let mut stream = listener.accept().await.unwrap();

        write_frame(&mut h.relay, &Frame::fwd(1, &[0u8; 9]).unwrap()).await.unwrap();
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_dial_accepted_and_rejected() {
        let h = harness(1024).await;
        let Harness {
            session, mut relay, ..
        } = h;
        let (dst_pk, dst_sk) = generate_keypair();

        let dialer = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .dial(Addr::new(dst_pk, 7), Duration::from_secs(5))
                    .await
            })
        };
        let req = read_frame(&mut relay).await.unwrap();
        assert_eq!(req.frame_type(), FrameType::Request);
        assert_eq!(req.stream_id() % 2, 0);
        let req_obj = SignedObject::from_bytes(req.payload().to_vec()).unwrap();
        let resp = StreamResponse::new(req_obj.hash(), 1, 512);
        let resp = SignedObject::sign(&resp, &dst_sk).unwrap();
        write_frame(
            &mut relay,
            &Frame::new(FrameType::Accept, req.stream_id(), resp.into_bytes()).unwrap(),
        )
        .await
        .unwrap();
        let mut stream = dialer.await.unwrap().unwrap();
        assert_eq!(stream.server_pk(), session.remote_pk());
        let open = session.streams();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].remote, Addr::new(dst_pk, 7));
        assert_eq!(open[0].server_pk, session.remote_pk());
        stream.write_all(b"hi").await.unwrap();
        assert_eq!(read_frame(&mut relay).await.unwrap().payload(), b"hi");

        let dialer = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .dial(Addr::new(dst_pk, 8), Duration::from_secs(5))
                    .await
            })
        };
        let req = read_frame(&mut relay).await.unwrap();
        write_frame(
            &mut relay,
            &Frame::close(req.stream_id(), HandshakeError::NoListener.code()),
        )
        .await
        .unwrap();
        assert!(matches!(
            dialer.await.unwrap(),
            Err(Error::Handshake(HandshakeError::NoListener))
        ));
        assert_eq!(session.stream_count(), 1);
        assert_eq!(session.streams().len(), 1);
    }

    #[tokio::test]
    async fn test_dial_timeout_discards_late_accept() {
        let Harness {
            session, mut relay, ..
        } = harness(1024).await;
        let (dst_pk, dst_sk) = generate_keypair();

        let err = session
            .dial(Addr::new(dst_pk, 7), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        let req = read_frame(&mut relay).await.unwrap();
        let close = read_frame(&mut relay).await.unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);
        assert_eq!(close.stream_id(), req.stream_id());

        let req_obj = SignedObject::from_bytes(req.payload().to_vec()).unwrap();
        let resp = SignedObject::sign(&StreamResponse::new(req_obj.hash(), 1, 512), &dst_sk).unwrap();
        write_frame(
            &mut relay,
            &Frame::new(FrameType::Accept, req.stream_id(), resp.into_bytes()).unwrap(),
        )
        .await
        .unwrap();
        write_frame(&mut relay, &Frame::close(req.stream_id(), ErrorCode::NORMAL))
            .await
            .unwrap();
        relay.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_closed());
        assert_eq!(session.stream_count(), 0);
    }
}
