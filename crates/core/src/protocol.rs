//! Defines the realtime message protocol between the chat client and the PaCo backend.

use serde::{Deserialize, Serialize};

/// The single request the client ever sends over the realtime channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub token: String,
    pub research_id: String,
    pub conversation_id: String,
    pub message: String,
    pub model: String,
}

/// One typed unit of backend-to-client data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental text for the reply being streamed.
    Chunk { content: Option<String> },
    /// The full, final text of the current turn.
    Complete {
        full_response: Option<String>,
        conversation_id: Option<String>,
    },
    /// Synthesized speech for the turn that just completed.
    Audio {
        audio_base64: Option<String>,
        audio_url: Option<String>,
    },
    /// The backend persisted the user's message.
    UserMessageSaved { conversation_id: Option<String> },
    /// The backend failed to produce a reply.
    Error { error: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame has no type")]
    Untyped,
}

/// Every field the backend may put on a frame. The backend sometimes sends a
/// bare `{"error": ...}` with no `type`, so the tag is optional here.
#[derive(Deserialize, Debug)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<String>,
    full_response: Option<String>,
    audio_base64: Option<String>,
    audio_url: Option<String>,
    conversation_id: Option<String>,
    error: Option<String>,
}

impl Frame {
    /// Parses one text payload received from the transport.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let wire: WireFrame = serde_json::from_str(raw)?;
        let Some(kind) = wire.kind else {
            return match wire.error {
                Some(error) => Ok(Frame::Error { error: Some(error) }),
                None => Err(ProtocolError::Untyped),
            };
        };
        match kind.as_str() {
            "chunk" => Ok(Frame::Chunk {
                content: wire.content,
            }),
            "complete" => Ok(Frame::Complete {
                full_response: wire.full_response,
                conversation_id: wire.conversation_id,
            }),
            "audio" => Ok(Frame::Audio {
                audio_base64: wire.audio_base64,
                audio_url: wire.audio_url,
            }),
            "user_message_saved" => Ok(Frame::UserMessageSaved {
                conversation_id: wire.conversation_id,
            }),
            "error" => Ok(Frame::Error { error: wire.error }),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Chunk { .. } => "chunk",
            Frame::Complete { .. } => "complete",
            Frame::Audio { .. } => "audio",
            Frame::UserMessageSaved { .. } => "user_message_saved",
            Frame::Error { .. } => "error",
        }
    }
}
