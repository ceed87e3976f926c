pub mod appstate;
pub mod client;
pub mod connection;
pub mod error;
pub mod room;
pub mod server;

use serde::{Deserialize, Serialize};

/// Whether a frame carries UTF-8 text or arbitrary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Text,
    Binary,
}

/// One relayed message.
///
/// The relay never looks inside the payload; whatever a client sends is
/// handed to the other room members unchanged, with the same kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Frame {
        Frame { kind, payload }
    }

    pub fn text(text: impl Into<String>) -> Frame {
        Frame::new(MessageKind::Text, text.into().into_bytes())
    }

    pub fn binary(payload: Vec<u8>) -> Frame {
        Frame::new(MessageKind::Binary, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Messages the relay itself sends to a client, as JSON text frames.
///
/// * Error: the request could not be served. The `message` field contains a
///   description of the problem. The only error a client ever sees is a full
///   room at join time.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponsePacket {
    Error {
        /// A description of the error that occurred.
        message: String,
    },
}

impl ResponsePacket {
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame::text(serde_json::to_string(self)?))
    }
}
