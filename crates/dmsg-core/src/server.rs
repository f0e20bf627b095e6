//! dmsg relay server.

use crate::backoff::Backoff;
use crate::client::sleep_or_cancel;
use crate::config::ServerConfig;
use crate::entity::{EntityCommon, SessionEvent};
use crate::error::Error;
use crate::server_session::ServerSession;
use crate::session::{configure_tcp, respond};
use dmsg_crypto::{PublicKey, SecretKey};
use dmsg_discovery::{DiscoveryClient, DiscoveryError, Entry, ServerInfo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Pause after a failed `accept` before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct ServerInner {
    entity: Arc<EntityCommon<ServerSession>>,
    config: ServerConfig,
    address: OnceLock<String>,
    entry: tokio::sync::Mutex<Option<Entry>>,
    ready: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A dmsg relay server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server. Nothing runs until [`Server::serve`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(
        sk: SecretKey,
        disc: Arc<dyn DiscoveryClient>,
        config: ServerConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (ready, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerInner {
                entity: EntityCommon::new(sk, disc),
                config,
                address: OnceLock::new(),
                entry: tokio::sync::Mutex::new(None),
                ready,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Identity of this relay
    #[must_use]
    pub fn local_pk(&self) -> PublicKey {
        self.inner.entity.pk()
    }

    /// Number of live client sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.entity.session_count()
    }

    /// Accept client sessions on `listener` until closed, advertising
    /// `advertise_addr` in discovery.
    ///
    /// Connections beyond `max_sessions` are dropped before the handshake.
    ///
    /// # Errors
    ///
    /// [`Error::EntityClosed`] if the server is closed, [`Error::Config`] if
    /// it is already serving.
    pub async fn serve(
        &self,
        listener: TcpListener,
        advertise_addr: impl Into<String>,
    ) -> Result<(), Error> {
        let entity = &self.inner.entity;
        let cancel = entity.cancel().clone();
        if cancel.is_cancelled() {
            return Err(Error::EntityClosed);
        }
        let advertise_addr = advertise_addr.into();
        if self.inner.address.set(advertise_addr.clone()).is_err() {
            return Err(Error::Config("server is already serving".into()));
        }
        if let Some(events) = entity.take_events() {
            entity.spawn(republish(self.inner.clone(), events));
        }
        info!(
            pk = %self.local_pk().short(),
            local = ?listener.local_addr().ok(),
            advertise = %advertise_addr,
            "Relay serving"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (conn, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    if !sleep_or_cancel(&cancel, ACCEPT_RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            };
            if entity.session_count() >= self.inner.config.max_sessions {
                warn!(%peer, max = self.inner.config.max_sessions, "Session capacity reached, dropping connection");
                continue;
            }
            let inner = self.inner.clone();
            entity.spawn(async move {
                if let Err(e) = inner.accept_session(conn, peer).await {
                    debug!(%peer, error = %e, "Session setup failed");
                }
            });
        }
        debug!(pk = %self.local_pk().short(), "Relay accept loop stopped");
        Ok(())
    }

    /// Resolves once the server is accepting and has published its entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntityClosed`] if the server closes first.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut rx = self.inner.ready.subscribe();
        let cancel = self.inner.entity.cancel();
        let ready = tokio::select! {
            r = rx.wait_for(|ready| *ready) => r.is_ok(),
            () = cancel.cancelled() => false,
        };
        if ready { Ok(()) } else { Err(Error::EntityClosed) }
    }

    /// Stop accepting, close every session and join background tasks.
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.entity.shutdown().await;
        info!(pk = %self.local_pk().short(), "Relay closed");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("pk", &self.local_pk().short())
            .field("address", &self.inner.address.get())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl ServerInner {
    async fn accept_session(&self, mut conn: TcpStream, peer: SocketAddr) -> Result<(), Error> {
        configure_tcp(&conn, self.config.keepalive)?;
        let entity = &self.entity;
        let remote = tokio::time::timeout(
            self.config.session_handshake_timeout,
            respond(&mut conn, entity.sk()),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        debug!(%peer, remote_pk = %remote.short(), "Session handshake complete");

        let session = ServerSession::start(
            conn,
            entity.pk(),
            remote,
            Arc::downgrade(entity),
            entity.cancel().child_token(),
        );
        if let Err(e) = entity.add_session(session.clone()) {
            // The existing session to this client stays.
            session.common().close();
            return Err(e);
        }
        Ok(())
    }

    fn available_sessions(&self) -> i64 {
        let free = self
            .config
            .max_sessions
            .saturating_sub(self.entity.session_count());
        i64::try_from(free).unwrap_or(i64::MAX)
    }

    async fn update_entry(&self) -> Result<(), Error> {
        let Some(address) = self.address.get().cloned() else {
            return Ok(());
        };
        let disc = self.entity.disc();
        let sk = self.entity.sk();
        let pk = self.entity.pk();
        let available_sessions = self.available_sessions();
        let info = ServerInfo {
            address: address.clone(),
            available_sessions,
        };

        let mut slot = self.entry.lock().await;
        match slot.as_mut() {
            Some(entry) => {
                entry.server = Some(info);
                disc.put_entry(sk, entry).await?;
            }
            None => {
                let entry = match disc.entry(&pk).await {
                    Ok(mut remote) => {
                        remote.server = Some(info);
                        disc.put_entry(sk, &mut remote).await?;
                        remote
                    }
                    Err(DiscoveryError::EntryNotFound) => {
                        let mut entry = Entry::new_server(pk, 0, address, available_sessions);
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

        debug!(pk = %pk.short(), available_sessions, "Server entry published");
        self.ready.send_replace(true);
        Ok(())
    }
}

/// Single task publishing the server entry: once at start, on every
/// session change and every `update_interval`.
async fn republish(inner: Arc<ServerInner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let cancel = inner.entity.cancel().clone();
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    let mut ticker = tokio::time::interval(inner.config.update_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    debug!(?event, "Session set changed");
                    while events.try_recv().is_ok() {}
                }
                None => break,
            },
            _ = ticker.tick() => {}
        }
        loop {
            match inner.update_entry().await {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Failed to publish server entry");
                    if !sleep_or_cancel(&cancel, delay).await {
                        return;
                    }
                }
            }
        }
    }
}
