//! Flow-controlled dmsg streams.
//!
//! A [`Stream`] is the application handle of one logical connection inside a
//! session. Incoming FWD payloads are buffered by the session's reader task
//! and drained by [`AsyncRead`]; writes are split into FWD frames no larger
//! than the remote window and queued to the session's writer task.
//!
//! Closing is a two-way exchange. The side that closes first sends CLOSE and
//! stays registered in its session as a tombstone until the peer's CLOSE
//! comes back; frames arriving in between are discarded.

use crate::addr::Addr;
use crate::error::{Error, ErrorCode};
use crate::frame::Frame;
use crate::listener::PortRelease;
use crate::window::{LocalWindow, RemoteWindow};
use crate::MAX_FRAME_PAYLOAD;
use dmsg_crypto::PublicKey;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Dial request sent, waiting for the peer
    Handshaking,
    /// Data may flow
    Open,
    /// Closed locally, remotely or by session teardown
    Closed,
}

/// Point-in-time view of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream id on the local session
    pub stream_id: u16,
    /// Local address
    pub local: Addr,
    /// Remote address
    pub remote: Addr,
    /// Relay carrying the stream
    pub server_pk: PublicKey,
    /// State when the snapshot was taken
    pub state: StreamState,
}

struct Inner {
    state: StreamState,
    buf: VecDeque<u8>,
    local: LocalWindow,
    remote: RemoteWindow,
    /// We sent CLOSE
    local_closed: bool,
    /// Peer sent CLOSE
    remote_closed: bool,
    /// Session is gone
    broken: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    port: Option<PortRelease>,
}

impl Inner {
    fn wake_all(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }

    fn finish(&mut self) {
        self.state = StreamState::Closed;
        self.buf.clear();
        self.port = None;
        self.wake_all();
    }
}

/// State shared between a [`Stream`] handle and its session.
pub(crate) struct StreamShared {
    id: u16,
    local: Addr,
    remote: Addr,
    server_pk: PublicKey,
    out: mpsc::UnboundedSender<Frame>,
    inner: Mutex<Inner>,
}

impl StreamShared {
    pub(crate) fn new(
        id: u16,
        local: Addr,
        remote: Addr,
        server_pk: PublicKey,
        local_window: u32,
        out: mpsc::UnboundedSender<Frame>,
        port: Option<PortRelease>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            local,
            remote,
            server_pk,
            out,
            inner: Mutex::new(Inner {
                state: StreamState::Handshaking,
                buf: VecDeque::new(),
                local: LocalWindow::new(local_window),
                remote: RemoteWindow::new(0),
                local_closed: false,
                remote_closed: false,
                broken: false,
                read_waker: None,
                write_waker: None,
                port,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain counters behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn remote(&self) -> Addr {
        self.remote
    }

    /// Handshake finished; the peer granted `remote_window`.
    pub(crate) fn open(&self, remote_window: u32) {
        let mut inner = self.lock();
        if inner.state == StreamState::Handshaking {
            inner.state = StreamState::Open;
            inner.remote = RemoteWindow::new(remote_window);
        }
    }

    /// Whether we already sent CLOSE and wait for the peer's.
    pub(crate) fn is_tombstone(&self) -> bool {
        self.lock().local_closed
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.id,
            local: self.local,
            remote: self.remote,
            server_pk: self.server_pk,
            state: self.state(),
        }
    }

    /// Buffer an incoming payload.
    pub(crate) fn on_fwd(&self, payload: Vec<u8>) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.local_closed {
            return Ok(());
        }
        if inner.state != StreamState::Open {
            return Err(Error::protocol(format!("fwd on stream {} before accept", self.id)));
        }
        inner.local.receive(payload.len() as u64)?;
        inner.buf.extend(payload);
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        Ok(())
    }

    /// Apply an ACK from the peer.
    pub(crate) fn on_ack(&self, offset: u64) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.local_closed {
            return Ok(());
        }
        if inner.state != StreamState::Open {
            return Err(Error::protocol(format!("ack on stream {} before accept", self.id)));
        }
        if inner.remote.ack(offset)? {
            if let Some(w) = inner.write_waker.take() {
                w.wake();
            }
        }
        Ok(())
    }

    /// Peer sent CLOSE. Returns whether we still owe it our own CLOSE.
    pub(crate) fn on_remote_close(&self) -> bool {
        let mut inner = self.lock();
        inner.remote_closed = true;
        let owe_reply = !inner.local_closed;
        inner.local_closed = true;
        inner.state = StreamState::Closed;
        inner.port = None;
        // Buffered bytes stay readable until EOF.
        inner.wake_all();
        owe_reply
    }

    /// Close from our side; sends CLOSE unless already closed.
    pub(crate) fn close_local(&self, code: ErrorCode) -> bool {
        let mut inner = self.lock();
        if inner.local_closed || inner.broken {
            return false;
        }
        inner.local_closed = true;
        inner.finish();
        drop(inner);

        debug!(stream_id = self.id, remote = %self.remote.short(), "Closing stream");
        let _ = self.out.send(Frame::close(self.id, code));
        true
    }

    /// Session is gone; every blocked operation fails.
    pub(crate) fn teardown(&self) {
        let mut inner = self.lock();
        inner.broken = true;
        inner.finish();
    }

    fn poll_read_inner(&self, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.lock();
        if inner.broken {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                Error::SessionClosed,
            )));
        }
        if !inner.buf.is_empty() {
            let n = out.remaining().min(inner.buf.len());
            let (front, back) = inner.buf.as_slices();
            let from_front = n.min(front.len());
            out.put_slice(&front[..from_front]);
            out.put_slice(&back[..n - from_front]);
            inner.buf.drain(..n);

            let offset = inner.local.consume(n as u64);
            if !inner.remote_closed {
                let _ = self.out.send(Frame::ack(self.id, offset));
            }
            return Poll::Ready(Ok(()));
        }
        if inner.local_closed || inner.remote_closed {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_write_inner(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.lock();
        if inner.broken {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                Error::SessionClosed,
            )));
        }
        if inner.local_closed || inner.remote_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let available = inner.remote.available();
        if available == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data.len().min(MAX_FRAME_PAYLOAD).min(available as usize);
        let frame = Frame::fwd(self.id, &data[..n]).map_err(io::Error::other)?;
        if self.out.send(frame).is_err() {
            inner.broken = true;
            inner.finish();
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                Error::SessionClosed,
            )));
        }
        // Window and frame size checked above.
        let _ = inner.remote.consume(n as u64);
        Poll::Ready(Ok(n))
    }
}

/// Application handle of a dmsg stream.
///
/// Reading returns EOF once the peer closed and buffered data is drained.
/// Shutting down the write side closes the whole stream. Dropping the handle
/// closes it as well.
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Local address
    #[must_use]
    pub fn local_addr(&self) -> Addr {
        self.shared.local
    }

    /// Remote address
    #[must_use]
    pub fn remote_addr(&self) -> Addr {
        self.shared.remote
    }

    /// Stream id on the local session
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.shared.id
    }

    /// Relay server this stream is routed through
    #[must_use]
    pub fn server_pk(&self) -> PublicKey {
        self.shared.server_pk
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Close the stream. Closing twice is a no-op.
    pub fn close(&self) {
        self.shared.close_local(ErrorCode::NORMAL);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("local", &self.shared.local.short())
            .field("remote", &self.shared.remote.short())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.close_local(ErrorCode::NORMAL);
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.poll_read_inner(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.shared.poll_write_inner(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close_local(ErrorCode::NORMAL);
        Poll::Ready(Ok(()))
    }
}
