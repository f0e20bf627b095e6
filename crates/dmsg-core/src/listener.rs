//! Listeners and local port bookkeeping.

use crate::addr::Addr;
use crate::error::Error;
use crate::stream::Stream;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Local ports handed to dialed streams
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

enum Binding {
    Listener(Arc<ListenerShared>),
    Ephemeral,
}

struct PortTable {
    bindings: HashMap<u16, Binding>,
    next_ephemeral: u16,
    closed: bool,
}

/// Per-client table of bound ports.
pub(crate) struct PortManager {
    table: Mutex<PortTable>,
}

impl PortManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(PortTable {
                bindings: HashMap::new(),
                next_ephemeral: *EPHEMERAL_PORTS.start(),
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PortTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a listener on `addr.port`.
    pub(crate) fn listen(self: &Arc<Self>, addr: Addr, accept_buffer: usize) -> Result<Listener, Error> {
        if addr.port == 0 {
            return Err(Error::InvalidAddr(format!("{addr}: port 0 cannot be bound")));
        }
        let mut table = self.lock();
        if table.closed {
            return Err(Error::EntityClosed);
        }
        if table.bindings.contains_key(&addr.port) {
            return Err(Error::PortOccupied);
        }

        let (tx, rx) = mpsc::channel(accept_buffer.max(1));
        let shared = Arc::new(ListenerShared {
            addr,
            tx: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
            port: Mutex::new(Some(PortRelease {
                ports: Arc::downgrade(self),
                port: addr.port,
            })),
        });
        table
            .bindings
            .insert(addr.port, Binding::Listener(shared.clone()));
        debug!(local = %addr.short(), "Listener bound");
        Ok(Listener {
            shared,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Listener bound on `port`, if any.
    pub(crate) fn listener(&self, port: u16) -> Option<Arc<ListenerShared>> {
        match self.lock().bindings.get(&port) {
            Some(Binding::Listener(l)) => Some(l.clone()),
            _ => None,
        }
    }

    /// Take a free ephemeral port until the returned guard drops.
    pub(crate) fn reserve_ephemeral(self: &Arc<Self>) -> Result<PortRelease, Error> {
        let mut table = self.lock();
        if table.closed {
            return Err(Error::EntityClosed);
        }
        let span = EPHEMERAL_PORTS.len();
        for _ in 0..span {
            let port = table.next_ephemeral;
            table.next_ephemeral = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };
            if let std::collections::hash_map::Entry::Vacant(slot) = table.bindings.entry(port) {
                slot.insert(Binding::Ephemeral);
                return Ok(PortRelease {
                    ports: Arc::downgrade(self),
                    port,
                });
            }
        }
        Err(Error::Exhausted("ephemeral port"))
    }

    fn release(&self, port: u16) {
        self.lock().bindings.remove(&port);
    }

    /// Refuse new bindings and close every listener.
    pub(crate) fn close_all(&self) {
        let listeners: Vec<Arc<ListenerShared>> = {
            let mut table = self.lock();
            table.closed = true;
            table
                .bindings
                .values()
                .filter_map(|b| match b {
                    Binding::Listener(l) => Some(l.clone()),
                    Binding::Ephemeral => None,
                })
                .collect()
        };
        for l in listeners {
            l.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, port: u16) -> bool {
        self.lock().bindings.contains_key(&port)
    }
}

/// Frees a bound port when dropped.
pub(crate) struct PortRelease {
    ports: Weak<PortManager>,
    port: u16,
}

impl PortRelease {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortRelease {
    fn drop(&mut self) {
        if let Some(ports) = self.ports.upgrade() {
            ports.release(self.port);
        }
    }
}

/// Acceptor-facing half of a listener.
pub(crate) struct ListenerShared {
    addr: Addr,
    tx: Mutex<Option<mpsc::Sender<Stream>>>,
    cancel: CancellationToken,
    port: Mutex<Option<PortRelease>>,
}

impl ListenerShared {
    /// Reserve a queue slot before accepting a stream.
    ///
    /// # Errors
    ///
    /// [`Error::AcceptChanMaxed`] if the queue is full,
    /// [`Error::ListenerClosed`] if the listener is closed.
    pub(crate) fn try_reserve(&self) -> Result<mpsc::OwnedPermit<Stream>, Error> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::ListenerClosed)?;
        tx.try_reserve_owned().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::AcceptChanMaxed,
            mpsc::error::TrySendError::Closed(_) => Error::ListenerClosed,
        })
    }

    /// Deliver a stream on a reserved slot.
    ///
    /// `accept` runs under the lock [`Listener::close`] takes, so a stream is
    /// either queued before the listener closes or never accepted.
    ///
    /// # Errors
    ///
    /// [`Error::ListenerClosed`] without calling `accept` if the listener
    /// closed after the slot was reserved. Errors of `accept` pass through.
    pub(crate) fn enqueue<F>(&self, permit: mpsc::OwnedPermit<Stream>, accept: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<Stream, Error>,
    {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.is_none() {
            return Err(Error::ListenerClosed);
        }
        permit.send(accept()?);
        Ok(())
    }

    /// Stop accepting. Returns `false` if already shut down.
    fn shutdown(&self) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if tx.is_none() {
            return false;
        }
        self.cancel.cancel();
        self.port.lock().unwrap_or_else(|e| e.into_inner()).take();
        debug!(local = %self.addr.short(), "Listener closed");
        true
    }
}

/// Accept queue of inbound streams on one port.
pub struct Listener {
    shared: Arc<ListenerShared>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Listener {
    /// Bound address
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.shared.addr
    }

    /// Wait for the next inbound stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] once the listener is closed.
    pub async fn accept(&self) -> Result<Stream, Error> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => Err(Error::ListenerClosed),
            stream = rx.recv() => stream.ok_or(Error::ListenerClosed),
        }
    }

    /// Close the listener, rejecting queued and in-flight streams.
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        if self.shared.shutdown() {
            let mut rx = self.rx.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    /// Whether the listener has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.shared.addr.short())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameType};
    use crate::stream::{StreamShared, StreamState};
    use dmsg_crypto::generate_keypair;
    use std::time::Duration;

    fn addr(port: u16) -> Addr {
        let (pk, _) = generate_keypair();
        Addr::new(pk, port)
    }

    fn stream_with_outbox() -> (Stream, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (relay, _) = generate_keypair();
        let shared = StreamShared::new(1, addr(1), addr(2), relay, 8, tx, None);
        shared.open(8);
        (Stream::new(shared), rx)
    }

    fn dummy_stream() -> Stream {
        stream_with_outbox().0
    }

    #[tokio::test]
    async fn test_port_occupied() {
        let ports = PortManager::new();
        let _l = ports.listen(addr(7), 4).unwrap();
        assert!(matches!(ports.listen(addr(7), 4), Err(Error::PortOccupied)));
        assert!(ports.listen(addr(0), 4).is_err());
    }

    #[tokio::test]
    async fn test_close_frees_port() {
        let ports = PortManager::new();
        let l = ports.listen(addr(7), 4).unwrap();
        l.close().await;
        l.close().await;
        assert!(l.is_closed());
        assert!(!ports.is_bound(7));
        assert!(ports.listen(addr(7), 4).is_ok());
    }

    #[tokio::test]
    async fn test_accept_queue_full() {
        let ports = PortManager::new();
        let l = ports.listen(addr(7), 2).unwrap();
        let shared = ports.listener(7).unwrap();

        let p1 = shared.try_reserve().unwrap();
        let _p2 = shared.try_reserve().unwrap();
        assert!(matches!(shared.try_reserve(), Err(Error::AcceptChanMaxed)));

        p1.send(dummy_stream());
        assert_eq!(l.accept().await.unwrap().stream_id(), 1);
    }

    #[tokio::test]
    async fn test_closed_listener_rejects_and_unblocks() {
        let ports = PortManager::new();
        let l = Arc::new(ports.listen(addr(7), 2).unwrap());
        let shared = ports.listener(7).unwrap();

        let waiter = {
            let l = l.clone();
            tokio::spawn(async move { l.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ports.close_all();

        assert!(matches!(waiter.await.unwrap(), Err(Error::ListenerClosed)));
        assert!(matches!(shared.try_reserve(), Err(Error::ListenerClosed)));
        assert!(matches!(ports.listen(addr(8), 2), Err(Error::EntityClosed)));
    }

    #[tokio::test]
    async fn test_close_rejects_reserved_slot() {
        let ports = PortManager::new();
        let l = ports.listen(addr(7), 2).unwrap();
        let shared = ports.listener(7).unwrap();

        let permit = shared.try_reserve().unwrap();
        l.close().await;

        let mut accepted = false;
        let res = shared.enqueue(permit, || {
            accepted = true;
            Ok(dummy_stream())
        });
        assert!(matches!(res, Err(Error::ListenerClosed)));
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_close_closes_queued_streams() {
        let ports = PortManager::new();
        let l = ports.listen(addr(7), 2).unwrap();
        let shared = ports.listener(7).unwrap();

        let (stream, mut outbox) = stream_with_outbox();
        assert_eq!(stream.state(), StreamState::Open);
        let permit = shared.try_reserve().unwrap();
        shared.enqueue(permit, || Ok(stream)).unwrap();
        l.close().await;

        let close = outbox.recv().await.unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);
        assert!(matches!(l.accept().await, Err(Error::ListenerClosed)));
    }

    #[test]
    fn test_ephemeral_ports_unique_and_released() {
        let ports = PortManager::new();
        let a = ports.reserve_ephemeral().unwrap();
        let b = ports.reserve_ephemeral().unwrap();
        assert_ne!(a.port(), b.port());
        assert!(EPHEMERAL_PORTS.contains(&a.port()));
        let port = a.port();
        drop(a);
        assert!(!ports.is_bound(port));
    }
}
