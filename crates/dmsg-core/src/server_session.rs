//! Relay end of a session with a client.
//!
//! A relayed stream is a [`Link`] joining one stream id on the initiator's
//! session to an odd id the relay allocates on the responder's session. The
//! relay never terminates the stream; it only checks the handshake objects,
//! enforces each hop's credit and rewrites ids.
//!
//! Lock order: a link's state lock may be held while taking a session's link
//! table lock, never the reverse. Table lookups clone the link and release
//! the table before touching it.

use crate::entity::EntityCommon;
use crate::error::{Error, ErrorCode, HandshakeError};
use crate::frame::{Frame, FrameType};
use crate::handshake::{SignedObject, StreamRequest, StreamResponse, TimestampTracker};
use crate::session::{Connection, FrameHandler, SessionCommon};
use crate::window::RemoteWindow;
use dmsg_crypto::{Hash, PublicKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which end of a link a session is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator = 0,
    Responder = 1,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    fn idx(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopState {
    Active,
    /// We sent CLOSE on this hop and wait for the client's
    AwaitingClose,
    /// Hop is finished and no longer in its session's table
    Gone,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Pending { req_hash: Hash },
    Open,
}

struct LinkState {
    phase: Phase,
    ids: [u16; 2],
    hops: [HopState; 2],
    /// Credit toward each side, as advertised by that side's client
    windows_to: [RemoteWindow; 2],
}

struct Hop {
    session: Weak<ServerSession>,
    pk: PublicKey,
}

struct Link {
    hops: [Hop; 2],
    state: Mutex<LinkState>,
}

impl Link {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, side: Side) -> Option<Arc<ServerSession>> {
        self.hops[side.idx()].session.upgrade()
    }

    /// Queue a frame on `side`'s hop, rewritten to that hop's id.
    fn send(&self, st: &LinkState, side: Side, frame: Frame) {
        if let Some(session) = self.session(side) {
            let _ = session
                .common
                .send(frame.with_stream_id(st.ids[side.idx()]));
        }
    }

    fn send_close(&self, st: &LinkState, side: Side, code: ErrorCode) {
        self.send(st, side, Frame::close(0, code));
    }

    /// Drop `side`'s table entry and mark its hop finished.
    fn forget(self: &Arc<Self>, st: &mut LinkState, side: Side) {
        st.hops[side.idx()] = HopState::Gone;
        if let Some(session) = self.session(side) {
            session.remove_link(st.ids[side.idx()], self);
        }
    }
}

struct LinkTable {
    links: HashMap<u16, (Arc<Link>, Side)>,
    next_odd: u16,
    req_ts: TimestampTracker,
    closed: bool,
}

impl LinkTable {
    fn alloc_odd(&mut self) -> Result<u16, Error> {
        for _ in 0..(u16::MAX / 2) {
            let id = self.next_odd;
            self.next_odd = self.next_odd.wrapping_add(2);
            if !self.links.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::Exhausted("stream id"))
    }
}

/// A live session between the relay and one client.
pub struct ServerSession {
    this: Weak<ServerSession>,
    common: SessionCommon,
    entity: Weak<EntityCommon<ServerSession>>,
    links: Mutex<LinkTable>,
}

impl ServerSession {
    /// Wrap a handshaken connection and start its tasks.
    pub(crate) fn start<C: Connection>(
        conn: C,
        local_pk: PublicKey,
        remote_pk: PublicKey,
        entity: Weak<EntityCommon<ServerSession>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            common: SessionCommon::new(local_pk, remote_pk, cancel),
            entity,
            links: Mutex::new(LinkTable {
                links: HashMap::new(),
                next_odd: 1,
                req_ts: TimestampTracker::default(),
                closed: false,
            }),
        });
        session.common.start(conn, session.clone());
        session
    }

    pub(crate) fn common(&self) -> &SessionCommon {
        &self.common
    }

    fn table(&self) -> MutexGuard<'_, LinkTable> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client on the other end
    #[must_use]
    pub fn remote_pk(&self) -> PublicKey {
        self.common.remote_pk()
    }

    /// Number of link hops registered on this session
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.table().links.len()
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

    fn remove_link(&self, id: u16, link: &Arc<Link>) {
        let mut table = self.table();
        if table
            .links
            .get(&id)
            .is_some_and(|(l, _)| Arc::ptr_eq(l, link))
        {
            table.links.remove(&id);
        }
    }

    fn lookup(&self, id: u16, kind: FrameType) -> Result<(Arc<Link>, Side), Error> {
        self.table()
            .links
            .get(&id)
            .map(|(l, s)| (l.clone(), *s))
            .ok_or_else(|| Error::protocol(format!("{kind} for unknown stream {id}")))
    }

    fn reject(&self, id: u16, err: &Error) {
        debug!(stream_id = id, remote_pk = %self.remote_pk().short(), error = %err, "Rejecting relayed request");
        let _ = self.common.send(Frame::close(id, err.code()));
    }

    fn handle_request(&self, id: u16, payload: Vec<u8>) -> Result<(), Error> {
        {
            let table = self.table();
            if table.closed {
                return Ok(());
            }
            if table.links.contains_key(&id) {
                return Err(Error::protocol(format!("request reuses stream {id}")));
            }
        }
        if let Err(e) = self.relay_request(id, payload) {
            self.reject(id, &e);
        }
        Ok(())
    }

    fn relay_request(&self, id: u16, payload: Vec<u8>) -> Result<(), Error> {
        let obj = SignedObject::from_bytes(payload)?;
        let req = StreamRequest::open(&obj)?;
        if req.src.pk != self.remote_pk() {
            return Err(HandshakeError::InvalidSrcPk.into());
        }
        self.table().req_ts.check(req.src.pk, req.timestamp)?;

        let entity = self.entity.upgrade().ok_or(Error::EntityClosed)?;
        let dst = entity
            .session(&req.dst.pk)
            .ok_or(HandshakeError::NoSession)?;

        let link = Arc::new(Link {
            hops: [
                Hop {
                    session: self.this.clone(),
                    pk: req.src.pk,
                },
                Hop {
                    session: Arc::downgrade(&dst),
                    pk: req.dst.pk,
                },
            ],
            state: Mutex::new(LinkState {
                phase: Phase::Pending {
                    req_hash: obj.hash(),
                },
                ids: [id, 0],
                hops: [HopState::Active; 2],
                windows_to: [RemoteWindow::new(req.window), RemoteWindow::new(0)],
            }),
        });

        // Hold the link while the responder hop is registered so an early
        // CLOSE from either side sees a consistent state.
        let mut st = link.lock();
        self.table()
            .links
            .insert(id, (link.clone(), Side::Initiator));
        let dst_id = {
            let mut table = dst.table();
            if table.closed {
                Err(HandshakeError::NoSession.into())
            } else {
                table.alloc_odd().inspect(|&dst_id| {
                    table.links.insert(dst_id, (link.clone(), Side::Responder));
                })
            }
        };
        let dst_id = match dst_id {
            Ok(dst_id) => dst_id,
            Err(e) => {
                st.hops = [HopState::Gone; 2];
                drop(st);
                self.remove_link(id, &link);
                return Err(e);
            }
        };
        st.ids[Side::Responder.idx()] = dst_id;

        debug!(
            src = %req.src.short(),
            dst = %req.dst.short(),
            src_id = id,
            dst_id,
            "Relaying stream request"
        );
        let frame = Frame::new(FrameType::Request, dst_id, obj.into_bytes())?;
        let _ = dst.common.send(frame);
        Ok(())
    }

    fn handle_accept(&self, link: &Arc<Link>, side: Side, payload: Vec<u8>) -> Result<(), Error> {
        if side == Side::Initiator {
            return Err(Error::protocol("ACCEPT from the dialing side"));
        }
        let mut st = link.lock();
        if st.hops[side.idx()] != HopState::Active {
            return Ok(());
        }
        let Phase::Pending { req_hash } = st.phase else {
            return Err(Error::protocol("duplicate ACCEPT"));
        };
        let initiator = Side::Initiator;

        if st.hops[initiator.idx()] != HopState::Active {
            // Dialer gave up while the responder was deciding.
            link.send_close(&st, side, ErrorCode::NORMAL);
            st.hops[side.idx()] = HopState::AwaitingClose;
            return Ok(());
        }

        let responder_pk = link.hops[side.idx()].pk;
        let verified = SignedObject::from_bytes(payload.clone())
            .and_then(|obj| StreamResponse::open(&obj, &req_hash, &responder_pk));
        match verified {
            Ok(resp) => {
                st.phase = Phase::Open;
                st.windows_to[side.idx()] = RemoteWindow::new(resp.window);
                let frame = Frame::new(FrameType::Accept, 0, payload)?;
                link.send(&st, initiator, frame);
                debug!(
                    initiator = %link.hops[0].pk.short(),
                    responder = %responder_pk.short(),
                    "Relayed stream open"
                );
            }
            Err(e) => {
                warn!(responder = %responder_pk.short(), error = %e, "Invalid relayed response");
                link.send_close(&st, side, ErrorCode::NORMAL);
                st.hops[side.idx()] = HopState::AwaitingClose;
                link.send_close(&st, initiator, e.code());
                link.forget(&mut st, initiator);
            }
        }
        Ok(())
    }

    fn handle_close(&self, link: &Arc<Link>, side: Side, code: ErrorCode) {
        let mut st = link.lock();
        let other = side.other();
        match st.hops[side.idx()] {
            HopState::Gone => return,
            HopState::AwaitingClose => {
                link.forget(&mut st, side);
                return;
            }
            HopState::Active => {}
        }

        match (st.phase, side) {
            (Phase::Pending { .. }, Side::Responder) => {
                // Rejection of the relayed request; no reply expected.
                link.forget(&mut st, side);
                if st.hops[other.idx()] == HopState::Active {
                    link.send_close(&st, other, code);
                    link.forget(&mut st, other);
                }
            }
            (Phase::Pending { .. }, Side::Initiator) => {
                // Dialer cancelled; the responder's answer is handled when
                // it arrives.
                link.send_close(&st, side, ErrorCode::NORMAL);
                link.forget(&mut st, side);
            }
            (Phase::Open, _) => {
                link.send_close(&st, side, ErrorCode::NORMAL);
                link.forget(&mut st, side);
                if st.hops[other.idx()] == HopState::Active {
                    link.send_close(&st, other, code);
                    st.hops[other.idx()] = HopState::AwaitingClose;
                }
            }
        }
    }

    fn handle_fwd(&self, link: &Arc<Link>, side: Side, frame: Frame) -> Result<(), Error> {
        let mut st = link.lock();
        if st.hops[side.idx()] != HopState::Active {
            return Ok(());
        }
        if !matches!(st.phase, Phase::Open) {
            return Err(Error::protocol("FWD on a relayed stream before accept"));
        }
        let other = side.other();
        st.windows_to[other.idx()].consume(frame.payload().len() as u64)?;
        if st.hops[other.idx()] == HopState::Active {
            link.send(&st, other, frame);
        }
        Ok(())
    }

    fn handle_ack(&self, link: &Arc<Link>, side: Side, frame: Frame) -> Result<(), Error> {
        let offset = frame.ack_offset()?;
        let mut st = link.lock();
        if st.hops[side.idx()] != HopState::Active {
            return Ok(());
        }
        if !matches!(st.phase, Phase::Open) {
            return Err(Error::protocol("ACK on a relayed stream before accept"));
        }
        st.windows_to[side.idx()].ack(offset)?;
        let other = side.other();
        if st.hops[other.idx()] == HopState::Active {
            link.send(&st, other, frame);
        }
        Ok(())
    }
}

impl FrameHandler for ServerSession {
    fn handle_frame(&self, frame: Frame) -> Result<(), Error> {
        let id = frame.stream_id();
        match frame.frame_type() {
            FrameType::Ok => Err(Error::protocol("OK frame after session handshake")),
            FrameType::Request => self.handle_request(id, frame.into_payload()),
            FrameType::Close => {
                let code = frame.close_code()?;
                let found = self.table().links.get(&id).map(|(l, s)| (l.clone(), *s));
                match found {
                    Some((link, side)) => self.handle_close(&link, side, code),
                    None => debug!(stream_id = id, "Close for unknown stream"),
                }
                Ok(())
            }
            FrameType::Accept => {
                let (link, side) = self.lookup(id, FrameType::Accept)?;
                self.handle_accept(&link, side, frame.into_payload())
            }
            FrameType::Fwd => {
                let (link, side) = self.lookup(id, FrameType::Fwd)?;
                self.handle_fwd(&link, side, frame)
            }
            FrameType::Ack => {
                let (link, side) = self.lookup(id, FrameType::Ack)?;
                self.handle_ack(&link, side, frame)
            }
        }
    }

    fn on_teardown(&self) {
        let links: Vec<(Arc<Link>, Side)> = {
            let mut table = self.table();
            table.closed = true;
            table.links.drain().map(|(_, v)| v).collect()
        };
        debug!(remote_pk = %self.remote_pk().short(), links = links.len(), "Relay session closed");

        for (link, side) in links {
            let mut st = link.lock();
            st.hops[side.idx()] = HopState::Gone;
            let other = side.other();
            if st.hops[other.idx()] != HopState::Active {
                continue;
            }
            match (st.phase, side) {
                (Phase::Pending { .. }, Side::Responder) => {
                    link.send_close(&st, other, HandshakeError::NoSession.code());
                    link.forget(&mut st, other);
                }
                (Phase::Pending { .. }, Side::Initiator) => {}
                (Phase::Open, _) => {
                    link.send_close(&st, other, ErrorCode::NORMAL);
                    st.hops[other.idx()] = HopState::AwaitingClose;
                }
            }
        }
    }
}
