//! Wire-level types shared by the chat client and the session.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard User-Agent header for llmsh requests.
pub const USER_AGENT: &str = concat!("llmsh/", env!("CARGO_PKG_VERSION"));

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversational turn, serialized as `{"role": .., "content": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A single decoded increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    /// Text delta carried by the frame, if any.
    pub delta: Option<String>,
    /// Set on the terminal `[DONE]` frame.
    pub done: bool,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            delta: None,
            done: true,
        }
    }
}

/// Categories of chat client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorKind {
    /// Connection refused, reset or dropped mid-request/mid-stream
    ConnectionLost,
    /// Whole-request deadline (connect + body drain) exceeded
    Timeout,
    /// Non-success HTTP status
    HttpStatus,
    /// Response body did not have the expected shape
    InvalidResponse,
    /// Request could not be built or sent for a non-network reason
    Request,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErrorKind::ConnectionLost => write!(f, "connection_lost"),
            ClientErrorKind::Timeout => write!(f, "timeout"),
            ClientErrorKind::HttpStatus => write!(f, "http_status"),
            ClientErrorKind::InvalidResponse => write!(f, "invalid_response"),
            ClientErrorKind::Request => write!(f, "request"),
        }
    }
}

/// Structured error from the chat client with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientError {
    /// Error category
    pub kind: ClientErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::ConnectionLost, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Timeout, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::InvalidResponse, message)
    }

    /// Creates an HTTP status error, lifting `error.message` out of JSON bodies.
    pub fn http_status(status: u16, body: &str) -> Self {
        if body.is_empty() {
            return Self::new(ClientErrorKind::HttpStatus, format!("HTTP {status}"));
        }

        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(msg) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        {
            return Self {
                kind: ClientErrorKind::HttpStatus,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }

        Self {
            kind: ClientErrorKind::HttpStatus,
            message: format!("HTTP {status}"),
            details: Some(body.to_string()),
        }
    }

    /// True when the server should be presumed crashed or unreachable.
    pub fn is_connection_lost(&self) -> bool {
        self.kind == ClientErrorKind::ConnectionLost
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ClientError {}

/// Result type for chat client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
