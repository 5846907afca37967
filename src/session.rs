use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::keepalive::KeepaliveTimer;
use crate::pty::{PtyError, PtyHandle};
use crate::scrollback::Scrollback;

pub type SessionId = Uuid;

/// Identifies one client connection within the process.
pub type ConnectionId = u64;

/// Validate a session name. Names must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("session name too long ({} chars, max 64)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!(
            "session name contains invalid characters: {}",
            name.chars().take(64).collect::<String>()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Shell spawned, no client has finished the handshake yet.
    Created,
    Attached,
    /// No clients attached. The keepalive timer runs unless a reconnecting
    /// client is still in its handshake.
    Detached,
    Terminated,
}

/// Why a session was terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    ShellExited { code: Option<u32> },
    KeepaliveExpired,
    Closed,
    ServerShutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::ShellExited { code: Some(code) } => write!(f, "shell exited with code {code}"),
            EndReason::ShellExited { code: None } => write!(f, "shell exited"),
            EndReason::KeepaliveExpired => write!(f, "keepalive expired"),
            EndReason::Closed => write!(f, "closed by administrator"),
            EndReason::ServerShutdown => write!(f, "server shutting down"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} has terminated")]
    Gone(SessionId),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Read-only view handed to listing endpoints. Never carries live handles.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub runspace_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub keepalive_deadline: Option<DateTime<Utc>>,
    pub attached: usize,
    pub scrollback_bytes: usize,
}

/// Result of joining a connection to a session's broadcast set.
#[derive(Debug)]
pub struct Attachment {
    /// Scrollback as it stood at the moment of joining.
    pub replay: Bytes,
    /// Live output produced after `replay` was taken.
    pub output: mpsc::Receiver<Bytes>,
    /// True if the session was detached right before this attach.
    pub reattached: bool,
}

struct SessionInner {
    state: SessionState,
    scrollback: Scrollback,
    clients: HashMap<ConnectionId, mpsc::Sender<Bytes>>,
    /// Every connection that attached and has not been released, including
    /// ones dropped from `clients` for falling behind.
    members: HashSet<ConnectionId>,
    /// Connections resolved to this session that have not sent `ready` yet.
    handshakes: usize,
    last_activity_at: DateTime<Utc>,
    keepalive: Option<KeepaliveTimer>,
    keepalive_generation: u64,
    end_reason: Option<EndReason>,
}

/// One shell bound to a runspace, plus everything attached to it.
///
/// All mutable state sits behind a single mutex. Appending output to the
/// scrollback, broadcasting it, and letting a new client join all happen under
/// that lock, so a client's replay and its live stream never overlap or leave
/// a gap.
pub struct Session {
    id: SessionId,
    name: String,
    runspace_id: String,
    created_at: DateTime<Utc>,
    pty: PtyHandle,
    inner: Mutex<SessionInner>,
    ended: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("runspace_id", &self.runspace_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        name: String,
        runspace_id: String,
        pty: PtyHandle,
        scrollback_bytes: usize,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            runspace_id,
            created_at: now,
            pty,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                scrollback: Scrollback::new(scrollback_bytes),
                clients: HashMap::new(),
                members: HashSet::new(),
                handshakes: 0,
                last_activity_at: now,
                keepalive: None,
                keepalive_generation: 0,
                end_reason: None,
            }),
            ended: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runspace_id(&self) -> &str {
        &self.runspace_id
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.inner.lock().end_reason.clone()
    }

    pub fn attached_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.inner.lock().last_activity_at
    }

    pub fn scrollback_snapshot(&self) -> Bytes {
        self.inner.lock().scrollback.snapshot()
    }

    /// Resolves once the session has terminated.
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock();
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            runspace_id: self.runspace_id.clone(),
            state: inner.state,
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            keepalive_deadline: inner.keepalive.as_ref().map(|t| t.deadline),
            attached: inner.clients.len(),
            scrollback_bytes: inner.scrollback.len(),
        }
    }

    /// Record a chunk of shell output and fan it out to every attached client.
    ///
    /// Clients whose queue is full are dropped rather than waited on; closing
    /// their sender is what tells the connection it fell behind.
    pub fn push_output(&self, data: Bytes) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Terminated {
            return;
        }
        inner.scrollback.append(&data);
        inner.last_activity_at = Utc::now();
        let session_id = self.id;
        inner.clients.retain(|conn, tx| match tx.try_send(data.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%session_id, conn, "client outbound queue full, dropping client");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Register a connection that is about to handshake.
    ///
    /// Pauses a pending keepalive so a client reconnecting inside the window
    /// cannot lose the session before it sends `ready`. Returns false once the
    /// session has terminated.
    pub fn hold(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Terminated {
            return false;
        }
        inner.handshakes += 1;
        if let Some(timer) = inner.keepalive.take() {
            tracing::debug!(session_id = %self.id, "keepalive paused for reconnect");
            timer.cancel();
        }
        true
    }

    /// Join `conn` to the broadcast set, consuming one handshake hold.
    ///
    /// The scrollback snapshot and the registration are taken under the same
    /// lock as [`Session::push_output`]: every byte lands in exactly one of
    /// `replay` or `output`. Cancels a pending keepalive.
    pub fn attach(&self, conn: ConnectionId, queue_len: usize) -> Result<Attachment, SessionError> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Terminated {
            return Err(SessionError::Gone(self.id));
        }
        let reattached = inner.state == SessionState::Detached;
        let replay = inner.scrollback.snapshot();
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        inner.clients.insert(conn, tx);
        inner.members.insert(conn);
        inner.handshakes = inner.handshakes.saturating_sub(1);
        inner.state = SessionState::Attached;
        inner.last_activity_at = Utc::now();
        if let Some(timer) = inner.keepalive.take() {
            timer.cancel();
        }
        Ok(Attachment {
            replay,
            output: rx,
            reattached,
        })
    }

    /// Remove `conn`, whether it attached or left during the handshake.
    ///
    /// Returns true if nothing holds the session any more and it is (now)
    /// `Detached` without a timer; the caller is then responsible for arming
    /// the keepalive. Safe to call for connections that were already dropped
    /// for falling behind, and more than once.
    pub fn release(&self, conn: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Terminated {
            return false;
        }
        inner.clients.remove(&conn);
        let was_handshaking = !inner.members.remove(&conn) && inner.handshakes > 0;
        if was_handshaking {
            inner.handshakes -= 1;
        }
        if !inner.clients.is_empty() || inner.handshakes > 0 {
            return false;
        }
        match inner.state {
            SessionState::Created | SessionState::Attached => {
                inner.state = SessionState::Detached;
                inner.last_activity_at = Utc::now();
                true
            }
            // A reconnect paused the timer and left before `ready`.
            SessionState::Detached => was_handshaking && inner.keepalive.is_none(),
            SessionState::Terminated => false,
        }
    }

    /// Install a keepalive timer if the session is detached and has none.
    ///
    /// Returns the timer's generation and cancellation token.
    pub(crate) fn arm_keepalive(&self, timeout: Duration) -> Option<(u64, CancellationToken)> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Detached || inner.keepalive.is_some() {
            return None;
        }
        inner.keepalive_generation += 1;
        let generation = inner.keepalive_generation;
        let timer = KeepaliveTimer::new(generation, timeout);
        let token = timer.token();
        inner.keepalive = Some(timer);
        Some((generation, token))
    }

    /// Terminate the session if timer `generation` is still the live one and
    /// nobody reattached in the meantime. Check and transition are atomic.
    pub(crate) fn expire(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.keepalive.as_ref().map(|t| t.generation);
        if inner.state != SessionState::Detached
            || !inner.clients.is_empty()
            || inner.handshakes > 0
            || current != Some(generation)
        {
            return false;
        }
        self.terminate_locked(&mut inner, EndReason::KeepaliveExpired);
        drop(inner);
        self.release_resources();
        true
    }

    /// Move to `Terminated`, notify clients, and stop the shell.
    ///
    /// Returns false if the session had already terminated.
    pub fn end(&self, reason: EndReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Terminated {
            return false;
        }
        self.terminate_locked(&mut inner, reason);
        drop(inner);
        self.release_resources();
        true
    }

    fn terminate_locked(&self, inner: &mut SessionInner, reason: EndReason) {
        tracing::info!(session_id = %self.id, session = %self.name, %reason, "session terminated");
        inner.state = SessionState::Terminated;
        inner.end_reason = Some(reason);
        // Dropping the senders closes each client's queue after whatever is
        // already buffered; connections then read `end_reason`.
        inner.clients.clear();
        inner.members.clear();
        inner.scrollback.clear();
        if let Some(timer) = inner.keepalive.take() {
            timer.cancel();
        }
    }

    fn release_resources(&self) {
        self.ended.cancel();
        self.pty.terminate();
    }

    /// Forward client input to the shell.
    pub async fn input(&self, data: Bytes) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Gone(self.id));
        }
        self.pty.write(data).await?;
        self.inner.lock().last_activity_at = Utc::now();
        Ok(())
    }

    /// Forward new terminal dimensions. Applied in every non-terminated state.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Gone(self.id));
        }
        self.pty.resize(cols, rows)?;
        Ok(())
    }
}
