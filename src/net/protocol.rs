use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An encoded outbound document, shared between every recipient of a broadcast
pub type Payload = Arc<[u8]>;

/// Longest accepted action name
pub const MAX_ACTION_LEN: usize = 64;

/// Message from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Opaque action name interpreted by the command consumer
    pub action: String,
    /// Free-text argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Recipient (participant name) for addressed actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Structured message text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InboundMessage {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: None,
            target: None,
            message: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Message from server to client, tagged by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Informational text
    Info(String),
    /// Request could not be served
    Error(ErrorBody),
    /// Chat line from another participant
    Chat(ChatBody),
    /// Arbitrary state snapshot produced by the command consumer
    State(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// How a chat line was addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatScope {
    Group,
    Direct,
    Area,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBody {
    pub scope: ChatScope,
    pub from: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self::Info(text.into())
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn chat(scope: ChatScope, from: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Chat(ChatBody {
            scope,
            from: from.into(),
            text: text.into(),
        })
    }

    /// The wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info(_) => "info",
            Self::Error(_) => "error",
            Self::Chat(_) => "chat",
            Self::State(_) => "state",
        }
    }
}

/// Encode an outbound message once for any number of recipients.
///
/// Compact JSON never contains a raw newline, so the result is safe to
/// coalesce with the frame delimiter.
pub fn encode(message: &OutboundMessage) -> Result<Payload, EncodeError> {
    serde_json::to_vec(message)
        .map(Payload::from)
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode and validate a single inbound document
pub fn decode(data: &[u8]) -> Result<InboundMessage, DecodeError> {
    let mut message: InboundMessage =
        serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string()))?;

    let action = message.action.trim();
    if action.is_empty() {
        return Err(DecodeError("action must not be empty".to_string()));
    }
    if action.len() > MAX_ACTION_LEN {
        return Err(DecodeError(format!(
            "action longer than {} bytes",
            MAX_ACTION_LEN
        )));
    }
    if action.len() != message.action.len() {
        message.action = action.to_string();
    }
    Ok(message)
}

/// Decode an outbound document (used by clients and tests)
pub fn decode_outbound(data: &[u8]) -> Result<OutboundMessage, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);
