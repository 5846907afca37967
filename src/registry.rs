use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::keepalive::{KeepaliveScheduler, DEFAULT_KEEPALIVE};
use crate::pty::{PtyError, PtyEvent, PtyHandle, PtyOptions};
use crate::runspace::RunspaceProvider;
use crate::scrollback::DEFAULT_SCROLLBACK_BYTES;
use crate::session::{
    validate_session_name, Attachment, ConnectionId, EndReason, Session, SessionError, SessionId,
    SessionSummary,
};

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId, name: String, runspace_id: String },
    Attached { id: SessionId, conn: ConnectionId },
    Detached { id: SessionId },
    Terminated { id: SessionId, reason: EndReason },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("runspace not found: {0}")]
    RunspaceNotFound(String),
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(#[source] PtyError),
    #[error("session has ended: {0}")]
    SessionGone(SessionId),
    #[error("invalid session name: {0}")]
    InvalidName(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

impl RegistryError {
    /// Machine-readable code sent to rejected clients.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::RunspaceNotFound(_) => "runspace_not_found",
            RegistryError::SpawnFailed(_) => "spawn_failed",
            RegistryError::SessionGone(_) => "session_gone",
            RegistryError::InvalidName(_) => "invalid_name",
            RegistryError::MaxSessionsReached => "max_sessions",
        }
    }
}

/// Tunables for sessions created by a registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub pty: PtyOptions,
    pub scrollback_bytes: usize,
    pub keepalive: Duration,
    pub max_sessions: Option<usize>,
    /// Outbound queue length per attached connection.
    pub outbound_queue: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pty: PtyOptions::default(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            keepalive: DEFAULT_KEEPALIVE,
            max_sessions: Some(SessionRegistry::DEFAULT_MAX_SESSIONS),
            outbound_queue: 256,
        }
    }
}

/// Outcome of [`SessionRegistry::create_or_attach`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub session: Arc<Session>,
    /// True if the session existed before this call.
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    runspace_id: String,
    name: String,
}

#[derive(Default)]
struct Indexes {
    by_key: HashMap<SessionKey, Arc<Session>>,
    by_id: HashMap<SessionId, Arc<Session>>,
    /// Slots claimed by spawns still in flight; counted against the limit.
    reserved: usize,
}

/// A session slot claimed before spawning. Dropping it unused gives it back.
struct SlotReservation<'a> {
    indexes: &'a RwLock<Indexes>,
    held: bool,
}

impl SlotReservation<'_> {
    /// Turn the reservation into a registered session.
    fn fill(mut self, key: &SessionKey, session: &Arc<Session>) {
        let mut indexes = self.indexes.write();
        indexes.reserved -= 1;
        indexes.by_key.insert(key.clone(), session.clone());
        indexes.by_id.insert(session.id(), session.clone());
        self.held = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.indexes.write().reserved -= 1;
        }
    }
}

struct RegistryInner {
    runspaces: Arc<dyn RunspaceProvider>,
    config: RegistryConfig,
    keepalive: KeepaliveScheduler,
    indexes: RwLock<Indexes>,
    /// One async mutex per (runspace, name) serializes create and evict for
    /// that key without blocking other keys.
    key_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    next_name: AtomicU64,
    next_conn: AtomicU64,
    spawned: AtomicU64,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// The one authority mapping `(runspace, name)` and session id to sessions.
///
/// Cheap to clone; every clone shares the same maps. Construct one per server
/// (or per test) and pass it around explicitly.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Default maximum number of live sessions.
    ///
    /// Each session costs a PTY pair and three OS threads.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new(runspaces: Arc<dyn RunspaceProvider>, config: RegistryConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                runspaces,
                keepalive: KeepaliveScheduler::new(config.keepalive),
                config,
                indexes: RwLock::new(Indexes::default()),
                key_locks: Mutex::new(HashMap::new()),
                next_name: AtomicU64::new(0),
                next_conn: AtomicU64::new(1),
                spawned: AtomicU64::new(0),
                events_tx,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn runspace_exists(&self, runspace_id: &str) -> bool {
        self.inner.runspaces.resolve(runspace_id).is_some()
    }

    /// Allocate an id for a new client connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of shells this registry has spawned over its lifetime.
    pub fn spawned_total(&self) -> u64 {
        self.inner.spawned.load(Ordering::Acquire)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.inner.events_tx.send(event);
    }

    /// Return the live session for `(name, runspace_id)`, creating it if needed.
    ///
    /// `name = None` always creates a new session under a generated name.
    /// Concurrent calls for the same key produce one spawn; the others get the
    /// winner's session with `restored = true`. A spawn failure leaves nothing
    /// registered.
    ///
    /// Every successful call takes a handshake hold on the session: its
    /// keepalive is paused until the caller either [`attach`](Self::attach)es
    /// or [`release`](Self::release)s.
    pub async fn create_or_attach(
        &self,
        name: Option<&str>,
        runspace_id: &str,
    ) -> Result<Resolved, RegistryError> {
        let runspace = self
            .inner
            .runspaces
            .resolve(runspace_id)
            .ok_or_else(|| RegistryError::RunspaceNotFound(runspace_id.to_string()))?;

        if let Some(name) = name {
            validate_session_name(name).map_err(RegistryError::InvalidName)?;
        }

        loop {
            let key = SessionKey {
                runspace_id: runspace_id.to_string(),
                name: match name {
                    Some(n) => n.to_string(),
                    None => self.generate_name(runspace_id),
                },
            };

            let lock = self.key_lock(&key);
            let guard = lock.lock().await;

            if let Some(existing) = self.live_by_key(&key) {
                if name.is_none() {
                    // Generated name was claimed by someone else meanwhile.
                    drop(guard);
                    self.prune_key_lock(&key, lock);
                    continue;
                }
                // Expiry takes the same key lock, so the hold cannot race it.
                if existing.hold() {
                    drop(guard);
                    self.prune_key_lock(&key, lock);
                    return Ok(Resolved {
                        session: existing,
                        restored: true,
                    });
                }
            }

            let result = self.spawn_session(&key, runspace.clone()).await;
            drop(guard);
            self.prune_key_lock(&key, lock);
            return result.map(|session| Resolved {
                session,
                restored: false,
            });
        }
    }

    /// Spawn and register. Caller holds the key lock.
    async fn spawn_session(
        &self,
        key: &SessionKey,
        runspace: crate::runspace::Runspace,
    ) -> Result<Arc<Session>, RegistryError> {
        let slot = self.reserve_slot()?;

        let mut options = self.inner.config.pty.clone();
        options
            .extra_env
            .push(("SHELLKEEP_SESSION".to_string(), key.name.clone()));
        options
            .extra_env
            .push(("SHELLKEEP_RUNSPACE".to_string(), key.runspace_id.clone()));

        let pty = tokio::task::spawn_blocking(move || PtyHandle::spawn(&runspace, &options))
            .await
            .map_err(|e| RegistryError::SpawnFailed(PtyError::SpawnCommand(anyhow::anyhow!(e))))?
            .map_err(|e| {
                tracing::warn!(runspace = %key.runspace_id, session = %key.name, error = %e, "shell spawn failed");
                RegistryError::SpawnFailed(e)
            })?;

        let session = Session::new(
            key.name.clone(),
            key.runspace_id.clone(),
            pty,
            self.inner.config.scrollback_bytes,
        );

        session.hold();
        slot.fill(key, &session);
        self.inner.spawned.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self.start_output_pump(&session) {
            // Unreachable in practice: the handle is brand new.
            tracing::error!(session_id = %session.id(), error = %e, "failed to start output pump");
            self.remove_indexes(&session);
            session.end(EndReason::ShellExited { code: None });
            return Err(RegistryError::SpawnFailed(e));
        }

        tracing::info!(
            session_id = %session.id(),
            session = %key.name,
            runspace = %key.runspace_id,
            pid = ?session.pty().pid(),
            "session created"
        );
        self.emit(SessionEvent::Created {
            id: session.id(),
            name: key.name.clone(),
            runspace_id: key.runspace_id.clone(),
        });
        Ok(session)
    }

    /// Claim a slot under the index lock, so concurrent creates for
    /// different keys cannot overshoot `max_sessions`.
    fn reserve_slot(&self) -> Result<SlotReservation<'_>, RegistryError> {
        let mut indexes = self.inner.indexes.write();
        if let Some(max) = self.inner.config.max_sessions {
            if indexes.by_id.len() + indexes.reserved >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }
        indexes.reserved += 1;
        Ok(SlotReservation {
            indexes: &self.inner.indexes,
            held: true,
        })
    }

    /// Route PTY output into the session; evict it when the shell exits.
    fn start_output_pump(&self, session: &Arc<Session>) -> Result<(), PtyError> {
        let weak = Arc::downgrade(session);
        let registry = self.clone();
        let runtime = tokio::runtime::Handle::current();
        let session_id = session.id();
        session.pty().on_output(move |event| match event {
            PtyEvent::Output(data) => {
                if let Some(session) = weak.upgrade() {
                    session.push_output(data);
                }
            }
            PtyEvent::Exited { code } => {
                let registry = registry.clone();
                runtime.spawn(async move {
                    registry
                        .evict_with(session_id, EndReason::ShellExited { code })
                        .await;
                });
            }
        })
    }

    /// Join a connection to a session, after the client said it is ready.
    pub fn attach(
        &self,
        session: &Arc<Session>,
        conn: ConnectionId,
    ) -> Result<Attachment, RegistryError> {
        let attachment = session
            .attach(conn, self.inner.config.outbound_queue)
            .map_err(|e| match e {
                SessionError::Gone(id) => RegistryError::SessionGone(id),
                SessionError::Pty(e) => RegistryError::SpawnFailed(e),
            })?;
        tracing::debug!(session_id = %session.id(), conn, reattached = attachment.reattached, "client attached");
        self.emit(SessionEvent::Attached {
            id: session.id(),
            conn,
        });
        Ok(attachment)
    }

    /// Drop a connection, attached or still handshaking. If nothing else holds
    /// the session, start the keepalive window.
    pub fn release(&self, session: &Arc<Session>, conn: ConnectionId) {
        if !session.release(conn) {
            return;
        }
        tracing::info!(
            session_id = %session.id(),
            session = %session.name(),
            keepalive = ?self.inner.keepalive.timeout(),
            "session detached"
        );
        self.emit(SessionEvent::Detached { id: session.id() });
        let registry = self.clone();
        self.inner.keepalive.schedule(session, move |session, generation| async move {
            registry.expire(session, generation).await;
        });
    }

    async fn expire(&self, session: Arc<Session>, generation: u64) {
        let key = key_of(&session);
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;
        if session.expire(generation) {
            self.remove_indexes(&session);
            self.emit(SessionEvent::Terminated {
                id: session.id(),
                reason: EndReason::KeepaliveExpired,
            });
        }
        drop(guard);
        self.prune_key_lock(&key, lock);
    }

    pub fn lookup_by_id(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.indexes.read().by_id.get(&id).cloned()
    }

    pub fn lookup(&self, name: &str, runspace_id: &str) -> Option<Arc<Session>> {
        let key = SessionKey {
            runspace_id: runspace_id.to_string(),
            name: name.to_string(),
        };
        self.inner.indexes.read().by_key.get(&key).cloned()
    }

    /// Administrative close: remove a session and stop its shell.
    ///
    /// Returns true if this call did it; closing an unknown or
    /// already-terminated id is a no-op.
    pub async fn close(&self, id: SessionId) -> bool {
        self.evict_with(id, EndReason::Closed).await
    }

    /// Evict with an explicit reason. Same contract as [`Self::close`].
    pub async fn evict_with(&self, id: SessionId, reason: EndReason) -> bool {
        let Some(session) = self.lookup_by_id(id) else {
            return false;
        };
        let key = key_of(&session);
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;

        self.remove_indexes(&session);
        let ended = session.end(reason.clone());
        if ended {
            self.emit(SessionEvent::Terminated { id, reason });
        }

        drop(guard);
        self.prune_key_lock(&key, lock);
        ended
    }

    /// Summaries of live sessions in a runspace, most recently active first.
    pub fn list_active(&self, runspace_id: &str) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = {
            let indexes = self.inner.indexes.read();
            indexes
                .by_key
                .iter()
                .filter(|(key, _)| key.runspace_id == runspace_id)
                .map(|(_, s)| s.clone())
                .collect()
        };
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .filter(|s| !s.is_terminated())
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        summaries
    }

    pub fn len(&self) -> usize {
        self.inner.indexes.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every session, then wait up to `grace` for the shells to
    /// actually exit. Used on server shutdown.
    ///
    /// Returns the number of sessions that were live.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let sessions = self.end_all();
        let exited = futures::future::join_all(sessions.iter().map(|s| s.pty().wait_exited()));
        if tokio::time::timeout(grace, exited).await.is_err() {
            tracing::warn!(?grace, "some shells did not exit before the shutdown deadline");
        }
        sessions.len()
    }

    fn end_all(&self) -> Vec<Arc<Session>> {
        let sessions: Vec<Arc<Session>> = {
            let mut indexes = self.inner.indexes.write();
            indexes.by_key.clear();
            indexes.by_id.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            if session.end(EndReason::ServerShutdown) {
                self.emit(SessionEvent::Terminated {
                    id: session.id(),
                    reason: EndReason::ServerShutdown,
                });
            }
        }
        sessions
    }

    fn live_by_key(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let indexes = self.inner.indexes.read();
        indexes
            .by_key
            .get(key)
            .filter(|s| !s.is_terminated())
            .cloned()
    }

    /// Remove from both indexes, but only entries that still point at `session`.
    fn remove_indexes(&self, session: &Arc<Session>) {
        let key = key_of(session);
        let mut indexes = self.inner.indexes.write();
        if indexes
            .by_key
            .get(&key)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            indexes.by_key.remove(&key);
        }
        indexes.by_id.remove(&session.id());
    }

    fn generate_name(&self, runspace_id: &str) -> String {
        let indexes = self.inner.indexes.read();
        loop {
            let candidate = self.inner.next_name.fetch_add(1, Ordering::Relaxed).to_string();
            let key = SessionKey {
                runspace_id: runspace_id.to_string(),
                name: candidate,
            };
            if !indexes.by_key.contains_key(&key) {
                return key.name;
            }
        }
    }

    fn key_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Give back a key lock, dropping the map entry once nobody else holds it.
    fn prune_key_lock(&self, key: &SessionKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.inner.key_locks.lock();
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

fn key_of(session: &Session) -> SessionKey {
    SessionKey {
        runspace_id: session.runspace_id().to_string(),
        name: session.name().to_string(),
    }
}
