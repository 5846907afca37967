//! Per-connection handshake and relay.
//!
//! The multiplexer is transport-agnostic: it reads [`Inbound`] frames from any
//! stream and writes [`ServerMessage`]s to any sink. The WebSocket handler in
//! `api` is one adapter; tests drive it with in-memory channels.
//!
//! ## Handshake
//!
//! 1. Resolve the session with `create_or_attach`, which pauses its
//!    keepalive until this connection attaches or leaves.
//! 2. Send `session {sessionId, sessionName, restored}`.
//! 3. Wait for the client's `ready`. Output produced meanwhile keeps landing
//!    in the scrollback.
//! 4. Join the broadcast set, which atomically snapshots the scrollback; send
//!    the snapshot as one `output` message, then relay live output.
//!
//! Because the snapshot and the join happen under the session lock, replay
//! plus live relay has no gap and no duplicate.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::protocol::{parse_client_message, skip_partial_char, ClientMessage, ServerMessage, Utf8Decoder};
use crate::pty::PtyError;
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{ConnectionId, EndReason, Session, SessionError};

/// Upper bound on a single send to the client transport.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// One frame received from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A protocol message, still unparsed.
    Text(String),
    /// Raw bytes for the shell's input.
    Binary(Bytes),
}

/// Transport-level connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// `None` creates a new session with a generated name.
    pub session_name: Option<String>,
    pub runspace_id: String,
}

/// How a connection finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The client went away. The session lives on.
    ClientClosed,
    /// The session terminated while this client was connected.
    SessionEnded(EndReason),
    /// The attach handshake failed; carries the error code sent to the client.
    Rejected(&'static str),
    /// The client fell too far behind and was cut off.
    SlowConsumer,
    /// A send to the client failed or timed out.
    TransportFailed,
    ServerShutdown,
}

enum Flow {
    Continue,
    Stop(Disconnect),
}

pub struct Multiplexer {
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl Multiplexer {
    pub fn new(registry: SessionRegistry, shutdown: CancellationToken) -> Self {
        Self { registry, shutdown }
    }

    /// Drive one client connection to completion.
    ///
    /// Never terminates the session on its own: when the client leaves, the
    /// connection is released and the registry decides whether to start the
    /// keepalive window.
    pub async fn run<S, K>(&self, request: ConnectRequest, mut inbound: S, mut outbound: K) -> Disconnect
    where
        S: Stream<Item = Inbound> + Unpin,
        K: Sink<ServerMessage> + Unpin,
    {
        let resolved = match self
            .registry
            .create_or_attach(request.session_name.as_deref(), &request.runspace_id)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(
                    runspace = %request.runspace_id,
                    session = ?request.session_name,
                    error = %e,
                    "attach rejected"
                );
                let code = e.code();
                send(&mut outbound, ServerMessage::error(code, e.to_string())).await;
                return Disconnect::Rejected(code);
            }
        };

        let session = resolved.session;
        let conn = self.registry.next_connection_id();
        tracing::info!(
            session_id = %session.id(),
            session = %session.name(),
            conn,
            restored = resolved.restored,
            "client connected"
        );

        let outcome = if send(
            &mut outbound,
            ServerMessage::Session {
                session_id: session.id(),
                session_name: session.name().to_string(),
                restored: resolved.restored,
            },
        )
        .await
        {
            self.relay(&session, conn, &mut inbound, &mut outbound).await
        } else {
            Disconnect::TransportFailed
        };

        self.registry.release(&session, conn);
        tracing::info!(session_id = %session.id(), conn, ?outcome, "client disconnected");
        outcome
    }

    async fn relay<S, K>(
        &self,
        session: &Arc<Session>,
        conn: ConnectionId,
        inbound: &mut S,
        outbound: &mut K,
    ) -> Disconnect
    where
        S: Stream<Item = Inbound> + Unpin,
        K: Sink<ServerMessage> + Unpin,
    {
        // Wait for `ready`. Input and resizes are honored already.
        loop {
            tokio::select! {
                frame = inbound.next() => {
                    let Some(frame) = frame else { return Disconnect::ClientClosed };
                    match decode(frame, session, conn) {
                        Some(Command::Ready) => break,
                        Some(cmd) => { self.apply(session, cmd).await; }
                        None => {}
                    }
                }
                _ = session.ended() => {
                    return self.announce_end(session, outbound).await;
                }
                _ = self.shutdown.cancelled() => return Disconnect::ServerShutdown,
            }
        }

        let attachment = match self.registry.attach(session, conn) {
            Ok(attachment) => attachment,
            Err(RegistryError::SessionGone(_)) if session.end_reason().is_some() => {
                return self.announce_end(session, outbound).await;
            }
            Err(e) => {
                let code = e.code();
                send(outbound, ServerMessage::error(code, e.to_string())).await;
                return Disconnect::Rejected(code);
            }
        };

        let mut decoder = Utf8Decoder::new();
        // Eviction may have cut the oldest character in half.
        let replay = skip_partial_char(&attachment.replay);
        if !replay.is_empty() {
            let data = decoder.decode(replay);
            if !send(outbound, ServerMessage::Output { data }).await {
                return Disconnect::TransportFailed;
            }
        }

        let mut output = attachment.output;
        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(bytes) => {
                        let data = decoder.decode(&bytes);
                        if data.is_empty() {
                            continue;
                        }
                        if !send(outbound, ServerMessage::Output { data }).await {
                            return Disconnect::TransportFailed;
                        }
                    }
                    None => {
                        if session.end_reason().is_some() {
                            let tail = decoder.finish();
                            if !tail.is_empty() {
                                send(outbound, ServerMessage::Output { data: tail }).await;
                            }
                            return self.announce_end(session, outbound).await;
                        }
                        tracing::warn!(session_id = %session.id(), conn, "client too slow, disconnecting");
                        send(
                            outbound,
                            ServerMessage::error("slow_consumer", "client fell behind the session output"),
                        )
                        .await;
                        return Disconnect::SlowConsumer;
                    }
                },
                frame = inbound.next() => {
                    let Some(frame) = frame else { return Disconnect::ClientClosed };
                    match decode(frame, session, conn) {
                        Some(Command::Ready) => {
                            tracing::debug!(session_id = %session.id(), conn, "duplicate ready ignored");
                        }
                        Some(cmd) => {
                            if let Flow::Stop(outcome) = self.apply(session, cmd).await {
                                return outcome;
                            }
                        }
                        None => {}
                    }
                }
                _ = self.shutdown.cancelled() => return Disconnect::ServerShutdown,
            }
        }
    }

    async fn apply(&self, session: &Arc<Session>, cmd: Command) -> Flow {
        match cmd {
            Command::Input(data) => match session.input(data).await {
                Ok(()) => Flow::Continue,
                // The exit monitor is about to end the session; the
                // session_ended notice follows through the output queue.
                Err(SessionError::Pty(PtyError::Exited)) | Err(SessionError::Gone(_)) => {
                    tracing::debug!(session_id = %session.id(), "input after shell exit dropped");
                    Flow::Continue
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "failed to forward input");
                    Flow::Continue
                }
            },
            Command::Resize { cols, rows } => {
                if let Err(e) = session.resize(cols, rows) {
                    tracing::warn!(session_id = %session.id(), cols, rows, error = %e, "resize failed");
                }
                Flow::Continue
            }
            Command::Ready => Flow::Continue,
        }
    }

    async fn announce_end<K>(&self, session: &Arc<Session>, outbound: &mut K) -> Disconnect
    where
        K: Sink<ServerMessage> + Unpin,
    {
        let reason = session
            .end_reason()
            .unwrap_or(EndReason::ShellExited { code: None });
        send(
            outbound,
            ServerMessage::SessionEnded {
                reason: reason.to_string(),
            },
        )
        .await;
        Disconnect::SessionEnded(reason)
    }
}

enum Command {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
    Ready,
}

/// Turn a transport frame into a command. Malformed frames are logged and
/// dropped; they never end the connection.
fn decode(frame: Inbound, session: &Session, conn: ConnectionId) -> Option<Command> {
    match frame {
        Inbound::Binary(data) => Some(Command::Input(data)),
        Inbound::Text(text) => match parse_client_message(&text) {
            Ok(ClientMessage::Input { data }) => Some(Command::Input(Bytes::from(data))),
            Ok(ClientMessage::Resize { cols, rows }) => Some(Command::Resize { cols, rows }),
            Ok(ClientMessage::Ready) => Some(Command::Ready),
            Err(e) => {
                tracing::warn!(session_id = %session.id(), conn, error = %e, "dropping malformed message");
                None
            }
        },
    }
}

/// Send with a timeout. Returns false if the write failed or timed out.
async fn send<K>(outbound: &mut K, msg: ServerMessage) -> bool
where
    K: Sink<ServerMessage> + Unpin,
{
    tokio::time::timeout(WRITE_TIMEOUT, outbound.send(msg))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
