//! Conversation state and the service facade driving the server.

pub mod interrupt;
pub mod service;
pub mod session;

pub use service::{InferenceService, SendError, ServiceState};
pub use session::{ConversationSession, LoadedTranscript, Turn};
