//! Session plumbing shared by clients and servers.
//!
//! A session owns one reliable connection to a peer. After the signed
//! session handshake it runs two tasks: a reader that decodes frames and
//! hands them to the role-specific [`FrameHandler`], and a writer that drains
//! the session's outbound queue. Both tasks stop when the session's
//! cancellation token fires; the reader then tears down the role state so
//! every stream blocked on the session is woken.

use crate::error::{Error, HandshakeError};
use crate::frame::{Frame, FrameType, read_frame, write_frame};
use crate::handshake::{SessionHello, SessionHelloAck, SignedObject};
use dmsg_crypto::{PublicKey, SecretKey};
use dmsg_discovery::entry::now_nanos;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Byte stream a session can run over.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

fn handshake_err(e: HandshakeError) -> Error {
    Error::SessionHandshake(e.to_string())
}

async fn read_hello_frame<C>(conn: &mut C) -> Result<SignedObject, Error>
where
    C: AsyncRead + Unpin + ?Sized,
{
    let frame = read_frame(conn).await?;
    if frame.frame_type() != FrameType::Ok || frame.stream_id() != 0 {
        return Err(Error::SessionHandshake(format!(
            "unexpected {} frame on stream {}",
            frame.frame_type(),
            frame.stream_id()
        )));
    }
    SignedObject::from_bytes(frame.into_payload()).map_err(handshake_err)
}

async fn write_hello_frame<C>(conn: &mut C, obj: SignedObject) -> Result<(), Error>
where
    C: AsyncWrite + Unpin + ?Sized,
{
    let frame = Frame::new(FrameType::Ok, 0, obj.into_bytes())?;
    write_frame(conn, &frame).await?;
    conn.flush().await?;
    Ok(())
}

/// Applies the socket options every session connection runs with.
///
/// Dead relays and peers are detected by TCP keepalive; the frame set
/// carries no ping.
pub(crate) fn configure_tcp(conn: &TcpStream, keepalive: Duration) -> io::Result<()> {
    conn.set_nodelay(true)?;
    let sock = SockRef::from(conn);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))
}

/// Dialer side of the session handshake.
///
/// # Errors
///
/// Fails with [`Error::SessionHandshake`] if the responder is not the
/// expected entity or answers with anything but a valid ack.
pub async fn initiate<C>(conn: &mut C, sk: &SecretKey, responder: PublicKey) -> Result<(), Error>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let hello = SessionHello::new(sk.public_key(), responder, now_nanos());
    let hello = SignedObject::sign(&hello, sk).map_err(handshake_err)?;
    let hello_hash = hello.hash();
    write_hello_frame(conn, hello).await?;

    let ack = read_hello_frame(conn).await?;
    SessionHelloAck::open(&ack, &hello_hash, &responder).map_err(handshake_err)?;
    Ok(())
}

/// Responder side of the session handshake. Returns the dialer's key.
///
/// # Errors
///
/// Fails with [`Error::SessionHandshake`] if the hello is not addressed to
/// us or is not signed by the key it claims.
pub async fn respond<C>(conn: &mut C, sk: &SecretKey) -> Result<PublicKey, Error>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let hello = read_hello_frame(conn).await?;
    let initiator = SessionHello::open(&hello, &sk.public_key())
        .map_err(handshake_err)?
        .initiator;

    let ack = SessionHelloAck::new(hello.hash(), now_nanos());
    let ack = SignedObject::sign(&ack, sk).map_err(handshake_err)?;
    write_hello_frame(conn, ack).await?;
    Ok(initiator)
}

/// Role-specific frame processing.
pub(crate) trait FrameHandler: Send + Sync + 'static {
    /// Process one inbound frame. An error is a protocol violation and
    /// ends the session.
    fn handle_frame(&self, frame: Frame) -> Result<(), Error>;

    /// The session is gone; release every stream.
    fn on_teardown(&self);
}

/// State every session has regardless of role.
pub(crate) struct SessionCommon {
    local_pk: PublicKey,
    remote_pk: PublicKey,
    out: mpsc::UnboundedSender<Frame>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SessionCommon {
    pub(crate) fn new(local_pk: PublicKey, remote_pk: PublicKey, cancel: CancellationToken) -> Self {
        let (out, out_rx) = mpsc::unbounded_channel();
        Self {
            local_pk,
            remote_pk,
            out,
            out_rx: Mutex::new(Some(out_rx)),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn local_pk(&self) -> PublicKey {
        self.local_pk
    }

    pub(crate) fn remote_pk(&self) -> PublicKey {
        self.remote_pk
    }

    /// Spawn the reader and writer tasks.
    pub(crate) fn start<C, H>(&self, conn: C, handler: std::sync::Arc<H>)
    where
        C: Connection,
        H: FrameHandler,
    {
        let Some(mut out_rx) = self
            .out_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let (reader, writer) = tokio::io::split(conn);
        let remote = self.remote_pk;

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut writer = BufWriter::new(writer);
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(remote_pk = %remote.short(), error = %e, "Session write failed");
                    break;
                }
                if out_rx.is_empty() && writer.flush().await.is_err() {
                    break;
                }
            }
            cancel.cancel();
            let _ = writer.shutdown().await;
        });

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = read_frame(&mut reader) => frame,
                };
                match frame {
                    Ok(frame) => {
                        if let Err(e) = handler.handle_frame(frame) {
                            warn!(remote_pk = %remote.short(), error = %e, "Tearing down session");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(remote_pk = %remote.short(), error = %e, "Session read ended");
                        break;
                    }
                }
            }
            cancel.cancel();
            handler.on_teardown();
        });
        self.tasks.close();
    }

    /// Queue a frame for the writer task.
    pub(crate) fn send(&self, frame: Frame) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        self.out.send(frame).map_err(|_| Error::SessionClosed)
    }

    /// Handle for streams to queue their own frames.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.out.clone()
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once both session tasks have finished.
    pub(crate) async fn closed(&self) {
        self.tasks.wait().await;
    }
}
