pub mod error;
mod handlers;
pub mod origin;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::registry::SessionRegistry;
use origin::OriginPolicy;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Cancelled once the server starts shutting down. Live connections
    /// watch it and close.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind: SocketAddr,
    /// Browser origins allowed to upgrade to WebSocket, on top of loopback.
    pub allowed_origins: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            allowed_origins: Vec::new(),
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let policy = Arc::new(OriginPolicy::for_port(
        config.bind.port(),
        config.allowed_origins,
    ));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_attach))
        .route("/runspaces/{id}/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .layer(axum::middleware::from_fn_with_state(
            policy,
            origin::check_ws_origin,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyOptions;
    use crate::registry::RegistryConfig;
    use crate::runspace::{Runspace, StaticRunspaces};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot()

    fn create_test_state(dir: &std::path::Path) -> AppState {
        let runspaces: StaticRunspaces = [Runspace::new("proj", dir)].into_iter().collect();
        let registry = SessionRegistry::new(
            Arc::new(runspaces),
            RegistryConfig {
                pty: PtyOptions {
                    shell: "/bin/sh".to_string(),
                    ..PtyOptions::default()
                },
                ..RegistryConfig::default()
            },
        );
        AppState::new(registry)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let response = app.oneshot(get("/health")).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["referrer-policy"], "no-referrer");
    }

    #[tokio::test]
    async fn list_sessions_for_unknown_runspace_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let response = app.oneshot(get("/runspaces/nope/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "runspace_not_found");
    }

    #[tokio::test]
    async fn list_sessions_empty_runspace() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let response = app.oneshot(get("/runspaces/proj/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn get_session_with_bad_id_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let response = app.oneshot(get("/sessions/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn get_unknown_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(create_test_state(dir.path()), RouterConfig::default());
        let uri = format!("/sessions/{}", uuid::Uuid::new_v4());
        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_summary_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let state = create_test_state(dir.path());
        let resolved = state
            .registry
            .create_or_attach(Some("work"), "proj")
            .await
            .unwrap();
        let id = resolved.session.id();
        let app = router(state.clone(), RouterConfig::default());

        let response = app
            .clone()
            .oneshot(get(&format!("/sessions/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "work");
        assert_eq!(json["runspaceId"], "proj");
        assert_eq!(json["state"], "created");

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{id}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(resolved.session.is_terminated());

        // Closing again is a no-op.
        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.registry.is_empty());
    }
}
