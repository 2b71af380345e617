//! Exec WebSocket protocol.
//!
//! Every WebSocket text message is one JSON object tagged by `type`:
//!
//! | direction        | type     | fields                    |
//! |------------------|----------|---------------------------|
//! | client → server  | `input`  | `data: string`            |
//! | client → server  | `resize` | `rows: u16, cols: u16`    |
//! | server → client  | `output` | `data: string`            |
//! | server → client  | `error`  | `data: string` (terminal) |

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::terminal::TerminalSize;

/// Frame sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Raw bytes for the remote process's stdin.
    Input { data: String },
    /// New terminal dimensions.
    Resize { rows: u16, cols: u16 },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The resize carried by this frame, if any.
    pub fn terminal_size(&self) -> Option<TerminalSize> {
        match self {
            ClientFrame::Resize { rows, cols } => Some(TerminalSize::new(*rows, *cols)),
            ClientFrame::Input { .. } => None,
        }
    }
}

/// Frame sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Bytes produced by the remote process.
    Output { data: String },
    /// Fatal condition. Nothing follows it; the channel is closed next.
    Error { data: String },
}

impl ServerFrame {
    pub fn output(data: impl Into<String>) -> Self {
        ServerFrame::Output { data: data.into() }
    }

    pub fn error(data: impl Into<String>) -> Self {
        ServerFrame::Error { data: data.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerFrame::Error { .. })
    }

    pub fn to_json(&self) -> String {
        // Both variants hold only strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Incremental UTF-8 decoder for remote output.
///
/// The remote stream is chunked at arbitrary byte boundaries, so a multi-byte
/// character can be split across two reads. Incomplete trailing sequences are
/// held back until the next chunk; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: BytesMut,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            let _ = self.pending.split_to(valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            let _ = self.pending.split_to(valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
