use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;

use super::error::ApiError;
use super::AppState;
use crate::multiplexer::{ConnectRequest, Disconnect, Inbound, Multiplexer};
use crate::protocol::ServerMessage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WsParams {
    runspace_id: String,
    #[serde(default)]
    session_name: Option<String>,
}

/// `GET /ws?runspaceId=..&sessionName=..`
pub(super) async fn ws_attach(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Result<impl IntoResponse, ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::ShuttingDown);
    }
    let request = ConnectRequest {
        // `sessionName=` means "pick a name for me".
        session_name: params.session_name.filter(|n| !n.is_empty()),
        runspace_id: params.runspace_id,
    };
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, state, request)))
}

async fn handle_ws(socket: WebSocket, state: AppState, request: ConnectRequest) {
    let (mut ws_tx, ws_rx) = socket.split();

    // Ping/Pong are answered by the transport; Close or an error ends input.
    let inbound = ws_rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)) | Err(_))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => Some(Inbound::Binary(data)),
                _ => None,
            })
        });

    let mux = Multiplexer::new(state.registry.clone(), state.shutdown.clone());
    let outcome = {
        let outbound = (&mut ws_tx).with(|msg: ServerMessage| future::ready(encode(&msg)));
        mux.run(request, Box::pin(inbound), Box::pin(outbound)).await
    };

    let close = match &outcome {
        Disconnect::ClientClosed | Disconnect::TransportFailed => None,
        Disconnect::SessionEnded(_) => Some((close_code::NORMAL, "session ended")),
        Disconnect::ServerShutdown => Some((close_code::AWAY, "server shutting down")),
        Disconnect::Rejected(code) => Some((close_code::POLICY, *code)),
        Disconnect::SlowConsumer => Some((close_code::POLICY, "slow_consumer")),
    };
    if let Some((code, reason)) = close {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        let _ = ws_tx.flush().await;
    }
}

fn encode(msg: &ServerMessage) -> Result<Message, axum::Error> {
    serde_json::to_string(msg)
        .map(|text| Message::Text(text.into()))
        .map_err(axum::Error::new)
}
