//! Wire envelope and payload types
//!
//! Every frame on the wire carries exactly one JSON envelope of the shape
//! `{"type": <kind>, "data": <payload>, "sender": <address>}`. The payload is
//! resolved into a closed [`Payload`] variant at decode time, so handlers never
//! inspect untyped data.

use crate::transfer::FileMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Unknown message kind: {0:?}")]
    UnknownKind(String),
    #[error("Malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Registered message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ping,
    Pong,
    Chat,
    FileRequest,
    FileMetadata,
    FileChunk,
    NewPeer,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Chat,
        MessageKind::FileRequest,
        MessageKind::FileMetadata,
        MessageKind::FileChunk,
        MessageKind::NewPeer,
    ];

    /// Wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Chat => "chat",
            MessageKind::FileRequest => "file_request",
            MessageKind::FileMetadata => "file_metadata",
            MessageKind::FileChunk => "file_chunk",
            MessageKind::NewPeer => "new_peer",
        }
    }

    /// Resolve a wire tag. Unknown and empty tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of a file in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u64,
    /// Raw chunk bytes, hex encoded on the wire
    #[serde(with = "hex")]
    pub chunk_data: Vec<u8>,
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ping(String),
    Pong(String),
    Chat(String),
    /// Requested filename or file id
    FileRequest(String),
    FileMetadata(FileMetadata),
    FileChunk(FileChunk),
    /// Announcing node's own listening address
    NewPeer(String),
}

impl Payload {
    pub fn ping() -> Self {
        Payload::Ping("ping".to_string())
    }

    pub fn pong() -> Self {
        Payload::Pong("pong".to_string())
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Pong(_) => MessageKind::Pong,
            Payload::Chat(_) => MessageKind::Chat,
            Payload::FileRequest(_) => MessageKind::FileRequest,
            Payload::FileMetadata(_) => MessageKind::FileMetadata,
            Payload::FileChunk(_) => MessageKind::FileChunk,
            Payload::NewPeer(_) => MessageKind::NewPeer,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Payload::Ping(s)
            | Payload::Pong(s)
            | Payload::Chat(s)
            | Payload::FileRequest(s)
            | Payload::NewPeer(s) => Ok(serde_json::Value::String(s.clone())),
            Payload::FileMetadata(meta) => serde_json::to_value(meta),
            Payload::FileChunk(chunk) => serde_json::to_value(chunk),
        }
    }

    fn from_value(kind: MessageKind, data: serde_json::Value) -> Result<Self, CodecError> {
        let malformed = |source| CodecError::MalformedPayload { kind, source };
        let payload = match kind {
            MessageKind::Ping => Payload::Ping(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::Pong => Payload::Pong(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::Chat => Payload::Chat(serde_json::from_value(data).map_err(malformed)?),
            MessageKind::FileRequest => {
                Payload::FileRequest(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageKind::FileMetadata => {
                Payload::FileMetadata(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageKind::FileChunk => {
                Payload::FileChunk(serde_json::from_value(data).map_err(malformed)?)
            }
            MessageKind::NewPeer => {
                Payload::NewPeer(serde_json::from_value(data).map_err(malformed)?)
            }
        };
        Ok(payload)
    }
}

/// The typed unit of wire communication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Payload,
    /// Sender's advertised address
    pub sender: String,
}

/// Untyped wire shape, used only at the serialization boundary
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    sender: String,
}

impl Envelope {
    pub fn new(payload: Payload, sender: impl Into<String>) -> Self {
        Self {
            payload,
            sender: sender.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let raw = RawEnvelope {
            kind: self.kind().as_str().to_string(),
            data: self.payload.to_value()?,
            sender: self.sender.clone(),
        };
        Ok(serde_json::to_vec(&raw)?)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let raw: RawEnvelope = serde_json::from_slice(data)?;
        let kind = MessageKind::from_tag(&raw.kind).ok_or(CodecError::UnknownKind(raw.kind))?;
        let payload = Payload::from_value(kind, raw.data)?;
        Ok(Self {
            payload,
            sender: raw.sender,
        })
    }
}
