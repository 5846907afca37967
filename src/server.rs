//! Composition root: configuration in, running HTTP/WebSocket server out.
//!
//! Owns the lifecycle of a [`SessionRegistry`]: sessions live exactly as long
//! as the server that created them. On shutdown every connection gets a close
//! frame and every shell is hung up.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::api::{self, AppState, RouterConfig};
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::runspace::{Runspace, StaticRunspaces};

/// How long shutdown waits for shells to exit after hanging them up.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runspaces from the config file, overridden by same-id entries in `extra`.
pub fn runspaces_from(config: &Config, extra: impl IntoIterator<Item = Runspace>) -> StaticRunspaces {
    let runspaces = StaticRunspaces::new();
    for runspace in config.runspaces.iter().cloned().chain(extra) {
        if !runspace.dir.is_dir() {
            tracing::warn!(
                runspace = %runspace.id,
                dir = %runspace.dir.display(),
                "runspace directory does not exist; sessions in it will fail to spawn"
            );
        }
        if let Some(previous) = runspaces.insert(runspace) {
            tracing::debug!(runspace = %previous.id, "runspace overridden");
        }
    }
    runspaces
}

/// Build the shared application state for `config`.
pub fn build_state(config: &Config, extra_runspaces: impl IntoIterator<Item = Runspace>) -> AppState {
    let runspaces = runspaces_from(config, extra_runspaces);
    let ids = runspaces.ids();
    if ids.is_empty() {
        tracing::warn!("no runspaces configured; every connection will be rejected");
    } else {
        tracing::info!(runspaces = ?ids, "runspaces loaded");
    }
    let registry = SessionRegistry::new(Arc::new(runspaces), config.registry_config());
    AppState::new(registry)
}

/// Serve until `state.shutdown` is cancelled, then drain all sessions.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    router_config: RouterConfig,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();
    let app = api::router(state, router_config);
    tracing::info!(%addr, "HTTP/WS server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    let drained = registry.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!(sessions = drained, "all sessions drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_runspaces_override_config() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let config = Config {
            runspaces: vec![Runspace::new("proj", a.path()), Runspace::new("docs", a.path())],
            ..Config::default()
        };
        let runspaces = runspaces_from(&config, [Runspace::new("proj", b.path())]);

        let mut ids = runspaces.ids();
        ids.sort();
        assert_eq!(ids, vec!["docs".to_string(), "proj".to_string()]);

        use crate::runspace::RunspaceProvider;
        assert_eq!(runspaces.resolve("proj").unwrap().dir, b.path());
    }

    #[tokio::test]
    async fn serve_stops_on_cancel_and_drains_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            shell: Some("/bin/sh".to_string()),
            runspaces: vec![Runspace::new("proj", dir.path())],
            ..Config::default()
        };
        let state = build_state(&config, Vec::new());
        let registry = state.registry.clone();
        let shutdown = state.shutdown.clone();
        let resolved = registry.create_or_attach(Some("work"), "proj").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(serve(listener, state, RouterConfig::default()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());
        assert!(resolved.session.is_terminated());
    }
}
