#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use shellkeep::api::{self, AppState, RouterConfig};
use shellkeep::multiplexer::{ConnectRequest, Disconnect, Inbound, Multiplexer};
use shellkeep::protocol::ServerMessage;
use shellkeep::pty::PtyOptions;
use shellkeep::registry::{RegistryConfig, SessionRegistry};
use shellkeep::runspace::{Runspace, StaticRunspaces};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry config that always spawns `/bin/sh`.
pub fn sh_config() -> RegistryConfig {
    RegistryConfig {
        pty: PtyOptions {
            shell: "/bin/sh".to_string(),
            ..PtyOptions::default()
        },
        ..RegistryConfig::default()
    }
}

/// A registry with one runspace, `proj`, rooted in a fresh temp directory.
/// Keep the `TempDir` alive for the duration of the test.
pub fn test_registry(config: RegistryConfig) -> (SessionRegistry, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let runspaces: StaticRunspaces = [Runspace::new("proj", dir.path())].into_iter().collect();
    (SessionRegistry::new(Arc::new(runspaces), config), dir)
}

// ── In-process multiplexer client ───────────────────────────────

/// One client driving a [`Multiplexer`] through in-memory channels.
pub struct MuxClient {
    pub to_server: mpsc::UnboundedSender<Inbound>,
    pub from_server: mpsc::Receiver<ServerMessage>,
    pub handle: JoinHandle<Disconnect>,
}

/// Connect a client. `outbound_buffer` bounds how far the multiplexer can run
/// ahead of a client that is not reading.
pub fn connect_mux_buffered(
    registry: &SessionRegistry,
    shutdown: &CancellationToken,
    session_name: Option<&str>,
    runspace_id: &str,
    outbound_buffer: usize,
) -> MuxClient {
    let (to_server, inbound) = mpsc::unbounded();
    let (outbound, from_server) = mpsc::channel(outbound_buffer);
    let mux = Multiplexer::new(registry.clone(), shutdown.clone());
    let request = ConnectRequest {
        session_name: session_name.map(str::to_string),
        runspace_id: runspace_id.to_string(),
    };
    let handle = tokio::spawn(async move { mux.run(request, inbound, outbound).await });
    MuxClient {
        to_server,
        from_server,
        handle,
    }
}

pub fn connect_mux(
    registry: &SessionRegistry,
    session_name: Option<&str>,
    runspace_id: &str,
) -> MuxClient {
    connect_mux_buffered(
        registry,
        &CancellationToken::new(),
        session_name,
        runspace_id,
        1024,
    )
}

impl MuxClient {
    pub fn send_text(&self, text: impl Into<String>) {
        self.to_server
            .unbounded_send(Inbound::Text(text.into()))
            .unwrap();
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.send_text(value.to_string());
    }

    pub fn ready(&self) {
        self.send_json(serde_json::json!({"type": "ready"}));
    }

    pub fn input(&self, data: &str) {
        self.send_json(serde_json::json!({"type": "input", "data": data}));
    }

    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.from_server.next())
            .await
            .expect("timeout waiting for server message")
            .expect("server closed the channel")
    }

    /// Next message, or None if nothing arrives within `timeout`.
    pub async fn try_recv(&mut self, timeout: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(timeout, self.from_server.next())
            .await
            .ok()
            .flatten()
    }

    /// Read the handshake `session` message.
    pub async fn expect_session(&mut self) -> (uuid::Uuid, String, bool) {
        match self.recv().await {
            ServerMessage::Session {
                session_id,
                session_name,
                restored,
            } => (session_id, session_name, restored),
            other => panic!("expected session message, got {:?}", other),
        }
    }

    /// Collect output until it contains `needle`. Panics on any other message.
    pub async fn output_until(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match self.recv().await {
                ServerMessage::Output { data } => seen.push_str(&data),
                other => panic!("expected output containing {:?}, got {:?} after {:?}", needle, other, seen),
            }
        }
        seen
    }

    /// Hang up and wait for the multiplexer to finish.
    pub async fn close(self) -> Disconnect {
        self.to_server.close_channel();
        tokio::time::timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("multiplexer did not finish")
            .unwrap()
    }
}

// ── HTTP/WebSocket server ───────────────────────────────────────

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsTx = futures::stream::SplitSink<WsStream, Message>;
pub type WsRx = futures::stream::SplitStream<WsStream>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<std::io::Result<()>>,
    _dir: TempDir,
}

/// Start the full server on an ephemeral port.
pub async fn start_server(config: RegistryConfig) -> TestServer {
    let (registry, dir) = test_registry(config);
    let state = AppState::new(registry);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router_config = RouterConfig {
        bind: addr,
        ..RouterConfig::default()
    };
    let handle = tokio::spawn(shellkeep::server::serve(listener, state.clone(), router_config));
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        state,
        handle,
        _dir: dir,
    }
}

/// Router only, for `tower::ServiceExt::oneshot` tests.
pub fn test_router(registry: SessionRegistry) -> axum::Router {
    api::router(AppState::new(registry), RouterConfig::default())
}

pub async fn connect_ws(addr: SocketAddr, query: &str) -> (WsTx, WsRx) {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?{}", addr, query))
        .await
        .unwrap();
    ws.split()
}

/// Helper: receive next text message, parse as JSON.
pub async fn recv_json(rx: &mut WsRx) -> serde_json::Value {
    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

pub async fn send_json(tx: &mut WsTx, value: serde_json::Value) {
    tx.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Read `output` messages until their data contains `needle`.
pub async fn ws_output_until(rx: &mut WsRx, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let msg = recv_json(rx).await;
        assert_eq!(msg["type"], "output", "unexpected message {msg} after {seen:?}");
        seen.push_str(msg["data"].as_str().unwrap());
    }
    seen
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// True if a process with this pid exists.
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
