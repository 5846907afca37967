//! Grace period for detached sessions.
//!
//! When the last client leaves, a session is not torn down. A timer starts
//! instead; reconnecting before it fires cancels it, otherwise the session is
//! evicted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// Default keepalive window: five minutes.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5 * 60);

/// A pending eviction, owned by the detached session it belongs to.
#[derive(Debug)]
pub(crate) struct KeepaliveTimer {
    pub(crate) generation: u64,
    pub(crate) deadline: DateTime<Utc>,
    token: CancellationToken,
}

impl KeepaliveTimer {
    pub(crate) fn new(generation: u64, timeout: Duration) -> Self {
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            generation,
            deadline,
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

/// Arms per-session countdowns.
#[derive(Debug, Clone)]
pub struct KeepaliveScheduler {
    timeout: Duration,
}

impl Default for KeepaliveScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE)
    }
}

impl KeepaliveScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start counting down for a detached session.
    ///
    /// `on_expire` receives the session and the timer generation once the
    /// window elapses without the timer being cancelled. It is expected to
    /// re-check the session under its own lock (see `Session::expire`), since
    /// a client may attach between the timer firing and the callback running.
    ///
    /// Returns false if the session was not detached or already had a timer.
    pub fn schedule<F, Fut>(&self, session: &Arc<Session>, on_expire: F) -> bool
    where
        F: FnOnce(Arc<Session>, u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some((generation, token)) = session.arm_keepalive(self.timeout) else {
            return false;
        };
        let timeout = self.timeout;
        let session_id = session.id();
        let weak = Arc::downgrade(session);
        tracing::debug!(%session_id, ?timeout, "keepalive armed");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let Some(session) = weak.upgrade() else { return };
                    on_expire(session, generation).await;
                }
                _ = token.cancelled() => {
                    tracing::debug!(%session_id, "keepalive cancelled");
                }
            }
        });
        true
    }
}
