//! Session bookkeeping shared by clients and servers.

use crate::client_session::ClientSession;
use crate::error::Error;
use crate::server_session::ServerSession;
use crate::session::SessionCommon;
use dmsg_crypto::{PublicKey, SecretKey};
use dmsg_discovery::DiscoveryClient;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Change to an entity's set of live sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// A session to this peer was registered
    Added(PublicKey),
    /// The session to this peer ended
    Removed(PublicKey),
}

pub(crate) trait EntitySession: Send + Sync + 'static {
    fn common(&self) -> &SessionCommon;
}

impl EntitySession for ClientSession {
    fn common(&self) -> &SessionCommon {
        ClientSession::common(self)
    }
}

impl EntitySession for ServerSession {
    fn common(&self) -> &SessionCommon {
        ServerSession::common(self)
    }
}

/// Identity, discovery handle and session map of one entity.
pub(crate) struct EntityCommon<S> {
    pk: PublicKey,
    sk: SecretKey,
    disc: Arc<dyn DiscoveryClient>,
    sessions: Mutex<HashMap<PublicKey, Arc<S>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<S: EntitySession> EntityCommon<S> {
    pub(crate) fn new(sk: SecretKey, disc: Arc<dyn DiscoveryClient>) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pk: sk.public_key(),
            sk,
            disc,
            sessions: Mutex::new(HashMap::new()),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn map(&self) -> MutexGuard<'_, HashMap<PublicKey, Arc<S>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn pk(&self) -> PublicKey {
        self.pk
    }

    pub(crate) fn sk(&self) -> &SecretKey {
        &self.sk
    }

    pub(crate) fn disc(&self) -> &dyn DiscoveryClient {
        self.disc.as_ref()
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawn a task joined by [`EntityCommon::shutdown`].
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    pub(crate) fn session(&self, pk: &PublicKey) -> Option<Arc<S>> {
        self.map().get(pk).cloned()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.map().len()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<S>> {
        self.map().values().cloned().collect()
    }

    /// Remote keys of all live sessions, sorted
    pub(crate) fn session_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.map().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Register a live session and watch it for teardown.
    ///
    /// # Errors
    ///
    /// [`Error::EntityClosed`] after shutdown, [`Error::DuplicateSession`]
    /// if a session to the same peer is already registered.
    pub(crate) fn add_session(self: &Arc<Self>, session: Arc<S>) -> Result<(), Error> {
        let pk = session.common().remote_pk();
        {
            let mut map = self.map();
            if self.cancel.is_cancelled() {
                return Err(Error::EntityClosed);
            }
            if map.contains_key(&pk) {
                return Err(Error::DuplicateSession(pk));
            }
            map.insert(pk, session.clone());
            let _ = self.events.send(SessionEvent::Added(pk));
        }
        info!(remote_pk = %pk.short(), "Session established");

        let entity = Arc::downgrade(self);
        self.tasks.spawn(async move {
            session.common().closed().await;
            if let Some(entity) = entity.upgrade() {
                entity.remove_session(&session);
            }
        });
        Ok(())
    }

    fn remove_session(&self, session: &Arc<S>) {
        let pk = session.common().remote_pk();
        let mut map = self.map();
        if map.get(&pk).is_some_and(|s| Arc::ptr_eq(s, session)) {
            map.remove(&pk);
            let _ = self.events.send(SessionEvent::Removed(pk));
            drop(map);
            info!(remote_pk = %pk.short(), "Session removed");
        }
    }

    /// Session events, for the single republish task
    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Cancel every session and background task, then join them.
    pub(crate) async fn shutdown(&self) {
        // Session tokens are children of ours.
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(pk = %self.pk.short(), "Entity shut down");
    }
}
