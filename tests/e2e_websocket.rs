//! End-to-end tests over a real TCP listener: WebSocket attach/reattach and
//! the HTTP session endpoints.

mod common;

use std::time::Duration;

use common::*;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use shellkeep::session::SessionState;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, protocol::frame::coding::CloseCode, Message,
};

/// Read until a close frame arrives; returns its code.
async fn expect_close(rx: &mut WsRx) -> CloseCode {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended without close frame")
            .expect("ws error");
        match msg {
            Message::Close(Some(frame)) => return frame.code,
            Message::Close(None) => panic!("close frame without a code"),
            _ => continue,
        }
    }
}

// ── Test 1: the reattach scenario ───────────────────────────────

#[tokio::test]
async fn detach_and_reattach_keeps_the_shell() {
    let server = start_server(sh_config()).await;

    let (mut tx, mut rx) = connect_ws(server.addr, "runspaceId=proj&sessionName=work").await;
    let hello = recv_json(&mut rx).await;
    assert_eq!(hello["type"], "session");
    assert_eq!(hello["sessionName"], "work");
    assert_eq!(hello["restored"], false);
    let session_id = hello["sessionId"].as_str().unwrap().to_string();

    send_json(&mut tx, json!({"type": "ready"})).await;
    send_json(&mut tx, json!({"type": "input", "data": "echo hi_$((0+1))\n"})).await;
    ws_output_until(&mut rx, "hi_1").await;

    // Drop the connection like a closed browser tab.
    tx.send(Message::Close(None)).await.unwrap();
    drop((tx, rx));

    let registry = &server.state.registry;
    let session = registry.lookup("work", "proj").unwrap();
    assert!(
        eventually(Duration::from_secs(2), || session.state() == SessionState::Detached).await
    );

    let (mut tx, mut rx) = connect_ws(server.addr, "runspaceId=proj&sessionName=work").await;
    let hello = recv_json(&mut rx).await;
    assert_eq!(hello["type"], "session");
    assert_eq!(hello["restored"], true);
    assert_eq!(hello["sessionId"], session_id.as_str());

    send_json(&mut tx, json!({"type": "ready"})).await;
    let replay = recv_json(&mut rx).await;
    assert_eq!(replay["type"], "output");
    assert!(replay["data"].as_str().unwrap().contains("hi_1"));

    assert_eq!(registry.spawned_total(), 1);
    registry.shutdown(RECV_TIMEOUT).await;
}

// ── Test 2: rejection over the wire ─────────────────────────────

#[tokio::test]
async fn unknown_runspace_gets_error_then_close() {
    let server = start_server(sh_config()).await;
    let (_tx, mut rx) = connect_ws(server.addr, "runspaceId=elsewhere&sessionName=x").await;

    let msg = recv_json(&mut rx).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["code"], "runspace_not_found");
    assert_eq!(expect_close(&mut rx).await, CloseCode::Policy);
    assert_eq!(server.state.registry.spawned_total(), 0);
}

#[tokio::test]
async fn missing_runspace_parameter_is_a_bad_request() {
    let server = start_server(sh_config()).await;
    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws?sessionName=x", server.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn foreign_origin_cannot_upgrade() {
    let server = start_server(sh_config()).await;
    let mut request = format!("ws://{}/ws?runspaceId=proj", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "http://evil.example".parse().unwrap());

    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
    assert_eq!(server.state.registry.spawned_total(), 0);
}

// ── Test 3: session end and shutdown ────────────────────────────

#[tokio::test]
async fn exit_sends_session_ended_and_normal_close() {
    let server = start_server(sh_config()).await;
    let (mut tx, mut rx) = connect_ws(server.addr, "runspaceId=proj&sessionName=gone").await;
    recv_json(&mut rx).await;
    send_json(&mut tx, json!({"type": "ready"})).await;
    send_json(&mut tx, json!({"type": "input", "data": "exit 3\n"})).await;

    let ended = loop {
        let msg = recv_json(&mut rx).await;
        if msg["type"] == "session_ended" {
            break msg;
        }
        assert_eq!(msg["type"], "output");
    };
    assert_eq!(ended["reason"], "shell exited with code 3");
    assert_eq!(expect_close(&mut rx).await, CloseCode::Normal);
    assert!(server.state.registry.lookup("gone", "proj").is_none());
}

#[tokio::test]
async fn shutdown_closes_connections_and_drains_sessions() {
    let server = start_server(sh_config()).await;
    let (mut tx, mut rx) = connect_ws(server.addr, "runspaceId=proj&sessionName=live").await;
    recv_json(&mut rx).await;
    send_json(&mut tx, json!({"type": "ready"})).await;

    let session = server.state.registry.lookup("live", "proj").unwrap();
    server.state.shutdown.cancel();

    assert_eq!(expect_close(&mut rx).await, CloseCode::Away);
    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(session.is_terminated());
    assert!(server.state.registry.is_empty());
}

// ── Test 4: HTTP endpoints ──────────────────────────────────────

#[tokio::test]
async fn list_get_and_close_over_http() {
    let server = start_server(sh_config()).await;
    let base = format!("http://{}", server.addr);
    let http = reqwest::Client::new();

    let (mut tx, mut rx) = connect_ws(server.addr, "runspaceId=proj&sessionName=listed").await;
    let hello = recv_json(&mut rx).await;
    let id = hello["sessionId"].as_str().unwrap().to_string();
    send_json(&mut tx, json!({"type": "ready"})).await;

    let registry = server.state.registry.clone();
    assert!(eventually(Duration::from_secs(2), || registry.list_active("proj").first().is_some_and(|s| s.attached == 1)).await);

    let list: serde_json::Value = http
        .get(format!("{base}/runspaces/proj/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], id.as_str());
    assert_eq!(list[0]["name"], "listed");
    assert_eq!(list[0]["state"], "attached");

    let resp = http.get(format!("{base}/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = http.delete(format!("{base}/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    // The attached client is told why.
    let ended = loop {
        let msg = recv_json(&mut rx).await;
        if msg["type"] == "session_ended" {
            break msg;
        }
    };
    assert_eq!(ended["reason"], "closed by administrator");

    let resp = http.get(format!("{base}/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = http.delete(format!("{base}/sessions/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    let resp = http.get(format!("{base}/runspaces/nowhere/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "runspace_not_found");
}

#[tokio::test]
async fn health_reports_session_count() {
    let server = start_server(sh_config()).await;
    server
        .state
        .registry
        .create_or_attach(Some("one"), "proj")
        .await
        .unwrap();

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
    server.state.registry.shutdown(RECV_TIMEOUT).await;
}
