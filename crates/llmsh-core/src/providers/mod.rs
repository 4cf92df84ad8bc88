//! Client side of the inference server's OpenAI-compatible HTTP API.

pub mod chat_completions;
pub mod shared;

pub use chat_completions::{ChatCompletionsClient, ChunkStream, DEFAULT_REQUEST_TIMEOUT};
pub use shared::{
    ChatMessage, ClientError, ClientErrorKind, ClientResult, Role, StreamChunk, USER_AGENT,
};
