//! Client/server message protocol.
//!
//! Every message is one JSON object with a `type` tag, carried in a single
//! transport frame (a WebSocket text frame in the HTTP server):
//!
//! | Direction | `type`          | Fields                                  |
//! |-----------|-----------------|-----------------------------------------|
//! | C→S       | `input`         | `data`                                  |
//! | C→S       | `resize`        | `cols`, `rows`                          |
//! | C→S       | `ready`         |                                         |
//! | S→C       | `session`       | `sessionId`, `sessionName`, `restored`  |
//! | S→C       | `output`        | `data`                                  |
//! | S→C       | `session_ended` | `reason`                                |
//! | S→C       | `error`         | `code`, `message`                       |

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Session {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "sessionName")]
        session_name: String,
        restored: bool,
    },
    Output {
        data: String,
    },
    /// The shell is gone for good, as opposed to a dropped connection.
    SessionEnded {
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
}

/// Parse and validate one inbound message.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let msg: ClientMessage = serde_json::from_str(text)?;
    if let ClientMessage::Resize { cols, rows } = msg {
        if cols == 0 || rows == 0 {
            return Err(ProtocolError::InvalidSize { cols, rows });
        }
    }
    Ok(msg)
}

/// Streaming UTF-8 decoder for shell output.
///
/// PTY reads split the byte stream at arbitrary points, including in the
/// middle of a multi-byte character. The incomplete tail is held back until
/// the next chunk arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back, lossily. Call once the stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Drop UTF-8 continuation bytes at the start of `bytes`.
///
/// A capped scrollback evicts whole bytes, so its oldest character may have
/// lost its lead byte. At most three bytes are skipped; anything else is
/// left for the decoder.
pub fn skip_partial_char(bytes: &[u8]) -> &[u8] {
    let skip = bytes
        .iter()
        .take(3)
        .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
        .count();
    &bytes[skip..]
}
