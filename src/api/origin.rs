// Cross-site WebSocket hijacking guard.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use super::error::ApiError;

/// Browser origins allowed to open a shell over WebSocket.
///
/// A page on any other site could otherwise drive a local shell through the
/// victim's browser, since WebSocket upgrades are not subject to CORS.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// The loopback origins for `port`, plus any extras from config.
    pub fn for_port(port: u16, extra: impl IntoIterator<Item = String>) -> Self {
        let mut allowed = vec![
            format!("http://127.0.0.1:{}", port),
            format!("http://localhost:{}", port),
            format!("http://[::1]:{}", port),
        ];
        allowed.extend(extra);
        Self { allowed }
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.allowed.iter().any(|o| o.eq_ignore_ascii_case(origin))
    }
}

/// Reject WebSocket upgrades whose `Origin` is not on the list.
///
/// Plain HTTP requests and clients that send no `Origin` (curl, agents,
/// native terminals) pass through.
pub async fn check_ws_origin(
    State(policy): State<Arc<OriginPolicy>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let is_ws_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_ws_upgrade {
        return Ok(next.run(req).await);
    }

    match req.headers().get(header::ORIGIN).map(|v| v.to_str()) {
        None => Ok(next.run(req).await),
        Some(Ok(origin)) if policy.allows(origin) => Ok(next.run(req).await),
        Some(origin) => {
            tracing::warn!(origin = ?origin, "rejected WebSocket upgrade from foreign origin");
            Err(ApiError::OriginNotAllowed)
        }
    }
}
