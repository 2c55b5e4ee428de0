//! Overlay frames: newline-delimited JSON `{kind, body}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Largest accepted frame line in bytes.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Handshake,
    Gossip,
    SearchRequest,
    SearchResponse,
    DhtStore,
    DhtFind,
    DhtFound,
    ChunkRequest,
    ChunkResponse,
}

impl FrameKind {
    /// Kinds that expect a reply frame.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            FrameKind::SearchRequest | FrameKind::DhtFind | FrameKind::ChunkRequest
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Set on requests that expect a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Set on replies; echoes the request id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: FrameKind, body: &T) -> Result<Self> {
        Ok(Self {
            kind,
            id: None,
            reply_to: None,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn empty(kind: FrameKind) -> Self {
        Self {
            kind,
            id: None,
            reply_to: None,
            body: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Turn this frame into a reply to `request`.
    pub fn in_reply_to(mut self, request: &Frame) -> Self {
        self.reply_to = request.id;
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Encode as a single line including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(line.len()));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
