//! dmsg client.
//!
//! A client keeps sessions to at least `min_sessions` relays, publishes the
//! set of relays it can be reached through, and dials or accepts streams
//! over those sessions.

use crate::addr::Addr;
use crate::backoff::Backoff;
use crate::client_session::ClientSession;
use crate::config::ClientConfig;
use crate::entity::{EntityCommon, SessionEvent};
use crate::error::Error;
use crate::listener::{Listener, PortManager};
use crate::session::{configure_tcp, initiate};
use crate::stream::{Stream, StreamInfo};
use dmsg_crypto::{PublicKey, SecretKey};
use dmsg_discovery::{ClientInfo, DiscoveryClient, DiscoveryError, Entry};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sleep for `d`; returns `false` if cancelled first.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(d) => true,
    }
}

struct ClientInner {
    entity: Arc<EntityCommon<ClientSession>>,
    config: ClientConfig,
    ports: Arc<PortManager>,
    dial_locks: Mutex<HashMap<PublicKey, Arc<tokio::sync::Mutex<()>>>>,
    entry: tokio::sync::Mutex<Option<Entry>>,
    ready: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A dmsg client. Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client. Nothing runs until [`Client::serve`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(
        sk: SecretKey,
        disc: Arc<dyn DiscoveryClient>,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (ready, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ClientInner {
                entity: EntityCommon::new(sk, disc),
                config,
                ports: PortManager::new(),
                dial_locks: Mutex::new(HashMap::new()),
                entry: tokio::sync::Mutex::new(None),
                ready,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Identity of this client
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.inner.entity.pk()
    }

    /// Number of live relay sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.entity.session_count()
    }

    /// Relays with a live session, sorted
    #[must_use]
    pub fn sessions(&self) -> Vec<PublicKey> {
        self.inner.entity.session_keys()
    }

    /// Keep relay sessions alive until the client is closed.
    ///
    /// Discovery and connection failures are retried with backoff; they
    /// never end the loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntityClosed`] if the client is already closed.
    pub async fn serve(&self) -> Result<(), Error> {
        let entity = &self.inner.entity;
        let cancel = entity.cancel().clone();
        if cancel.is_cancelled() {
            return Err(Error::EntityClosed);
        }
        if let Some(events) = entity.take_events() {
            entity.spawn(republish(self.inner.clone(), events));
        }

        let mut backoff = Backoff::new(self.inner.config.backoff.clone());
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delay = if entity.session_count() >= self.inner.config.min_sessions {
                backoff.initial()
            } else {
                match self.connect_more().await {
                    Ok(true) => {
                        backoff.reset();
                        continue;
                    }
                    Ok(false) => backoff.next_delay(),
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch available servers");
                        backoff.next_delay()
                    }
                }
            };
            if !sleep_or_cancel(&cancel, delay).await {
                break;
            }
        }
        debug!(pk = %self.local_pk().short(), "Client serve loop stopped");
        Ok(())
    }

    /// Try available relays until `min_sessions` is reached. Returns whether
    /// any session was added.
    async fn connect_more(&self) -> Result<bool, Error> {
        let entity = &self.inner.entity;
        let servers = entity.disc().available_servers().await?;
        let mut added = false;
        for server in servers {
            if entity.session_count() >= self.inner.config.min_sessions {
                break;
            }
            if entity.session(&server.static_pk).is_some() {
                continue;
            }
            match self.ensure_session(server.static_pk).await {
                Ok(_) => added = true,
                Err(e) => {
                    warn!(remote_pk = %server.static_pk.short(), error = %e, "Failed to establish session");
                }
            }
        }
        Ok(added)
    }

    fn dial_lock(&self, pk: PublicKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .dial_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(pk)
            .or_default()
            .clone()
    }

    /// Session to relay `pk`, establishing one if needed.
    ///
    /// Concurrent calls for the same relay share one connection attempt.
    ///
    /// # Errors
    ///
    /// Fails if the relay has no server entry, cannot be reached or fails
    /// the session handshake.
    pub async fn ensure_session(&self, pk: PublicKey) -> Result<Arc<ClientSession>, Error> {
        let entity = &self.inner.entity;
        if let Some(session) = entity.session(&pk) {
            return Ok(session);
        }
        let lock = self.dial_lock(pk);
        let _guard = lock.lock().await;
        if let Some(session) = entity.session(&pk) {
            return Ok(session);
        }
        if entity.cancel().is_cancelled() {
            return Err(Error::EntityClosed);
        }

        let entry = entity.disc().entry(&pk).await?;
        let server = entry.server.ok_or(Error::DiscEntryIsNotServer)?;
        self.connect_session(pk, &server.address).await
    }

    async fn connect_session(&self, pk: PublicKey, address: &str) -> Result<Arc<ClientSession>, Error> {
        let entity = &self.inner.entity;
        let sk = entity.sk().clone();
        let connect = async {
            let mut conn = TcpStream::connect(address).await?;
            configure_tcp(&conn, self.inner.config.keepalive)?;
            initiate(&mut conn, &sk, pk).await?;
            Ok::<_, Error>(conn)
        };
        let conn = tokio::time::timeout(self.inner.config.session_handshake_timeout, connect)
            .await
            .map_err(|_| Error::Timeout)??;

        let relay_addr = conn.peer_addr().ok();
        let session = ClientSession::start(
            conn,
            relay_addr,
            sk,
            pk,
            self.inner.ports.clone(),
            self.inner.config.local_window,
            entity.cancel().child_token(),
        );
        if let Err(e) = entity.add_session(session.clone()) {
            session.common().close();
            return Err(e);
        }
        Ok(session)
    }

    /// Dial a stream to `addr`.
    ///
    /// Prefers a relay this client already has a session with; otherwise
    /// connects to the remote's delegated relays in order.
    ///
    /// # Errors
    ///
    /// Discovery errors if the remote is not a reachable client,
    /// [`Error::CannotConnectToDelegated`] if none of its relays can be
    /// reached, or the stream handshake error reported by the remote.
    pub async fn dial(&self, addr: Addr) -> Result<Stream, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::EntityClosed);
        }
        let entity = &self.inner.entity;
        let entry = entity.disc().entry(&addr.pk).await?;
        let delegated = entry
            .client
            .ok_or(Error::DiscEntryIsNotClient)?
            .delegated_servers;
        if delegated.is_empty() {
            return Err(Error::DiscEntryHasNoDelegated);
        }

        let timeout = self.inner.config.handshake_timeout;
        for relay in &delegated {
            if let Some(session) = entity.session(relay) {
                return session.dial(addr, timeout).await;
            }
        }
        for relay in &delegated {
            match self.ensure_session(*relay).await {
                Ok(session) => return session.dial(addr, timeout).await,
                Err(e) => {
                    debug!(relay = %relay.short(), error = %e, "Delegated server unreachable");
                }
            }
        }
        Err(Error::CannotConnectToDelegated)
    }

    /// Network addresses of the relays with a live session
    #[must_use]
    pub fn connected_servers(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .inner
            .entity
            .sessions()
            .iter()
            .filter_map(|session| session.relay_addr())
            .collect();
        addrs.sort();
        addrs
    }

    /// Snapshot of every established stream over every relay session
    #[must_use]
    pub fn all_streams(&self) -> Vec<StreamInfo> {
        self.inner
            .entity
            .sessions()
            .iter()
            .flat_map(|session| session.streams())
            .collect()
    }

    /// Remote clients with an established stream, each mapped to the
    /// sorted relays carrying those streams
    #[must_use]
    pub fn connections_summary(&self) -> HashMap<PublicKey, Vec<PublicKey>> {
        let mut summary: HashMap<PublicKey, Vec<PublicKey>> = HashMap::new();
        for info in self.all_streams() {
            summary.entry(info.remote.pk).or_default().push(info.server_pk);
        }
        for relays in summary.values_mut() {
            relays.sort();
            relays.dedup();
        }
        summary
    }

    /// Listen for streams on `port`.
    ///
    /// # Errors
    ///
    /// [`Error::PortOccupied`] if the port is taken, [`Error::EntityClosed`]
    /// after close.
    pub fn listen(&self, port: u16) -> Result<Listener, Error> {
        self.inner
            .ports
            .listen(Addr::new(self.local_pk(), port), self.inner.config.accept_buffer)
    }

    /// Resolves once an entry with at least one delegated relay has been
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntityClosed`] if the client closes first.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut rx = self.inner.ready.subscribe();
        let cancel = self.inner.entity.cancel();
        let ready = tokio::select! {
            r = rx.wait_for(|ready| *ready) => r.is_ok(),
            () = cancel.cancelled() => false,
        };
        if ready { Ok(()) } else { Err(Error::EntityClosed) }
    }

    /// Close sessions, listeners and streams, join background tasks and
    /// remove the entry from discovery. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.ports.close_all();
        self.inner.entity.shutdown().await;

        if let Some(entry) = self.inner.entry.lock().await.take() {
            if let Err(e) = self.inner.entity.disc().del_entry(&entry).await {
                debug!(error = %e, "Failed to delete client entry");
            }
        }
        info!(pk = %self.local_pk().short(), "Client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pk", &self.local_pk().short())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl ClientInner {
    /// Publish the current delegated set.
    async fn update_entry(&self) -> Result<(), Error> {
        let disc = self.entity.disc();
        let sk = self.entity.sk();
        let pk = self.entity.pk();
        let delegated = self.entity.session_keys();
        let info = ClientInfo {
            delegated_servers: delegated.clone(),
        };

        let mut slot = self.entry.lock().await;
        match slot.as_mut() {
            Some(entry) => {
                entry.client = Some(info);
                disc.put_entry(sk, entry).await?;
            }
            None => {
                let entry = match disc.entry(&pk).await {
                    Ok(mut remote) => {
                        remote.client = Some(info);
                        disc.put_entry(sk, &mut remote).await?;
                        remote
                    }
                    Err(DiscoveryError::EntryNotFound) => {
                        let mut entry = Entry::new_client(pk, 0, delegated.clone());
                        entry.sign(sk);
                        disc.post_entry(&entry).await?;
                        entry
                    }
                    Err(e) => return Err(e.into()),
                };
                *slot = Some(entry);
            }
        }
        drop(slot);

        debug!(pk = %pk.short(), delegated = delegated.len(), "Client entry published");
        if !delegated.is_empty() {
            self.ready.send_replace(true);
        }
        Ok(())
    }
}

/// Single task publishing the client entry on session changes and every
/// `update_interval`.
async fn republish(inner: Arc<ClientInner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let cancel = inner.entity.cancel().clone();
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    let mut ticker = tokio::time::interval(inner.config.update_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let dirty = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    debug!(?event, "Session set changed");
                    while events.try_recv().is_ok() {}
                    true
                }
                None => break,
            },
            _ = ticker.tick() => inner.entry.lock().await.is_some(),
        };
        if !dirty {
            continue;
        }
        loop {
            match inner.update_entry().await {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Failed to publish client entry");
                    if !sleep_or_cancel(&cancel, delay).await {
                        return;
                    }
                }
            }
        }
    }
}
