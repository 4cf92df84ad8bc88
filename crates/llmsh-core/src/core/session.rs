//! Conversation transcript kept between requests.
//!
//! The transcript holds user and assistant turns in the order they happened.
//! The system prompt is never stored; it is put in front of the transcript
//! each time a request is built.
//!
//! ## Saved format
//!
//! ```json
//! {
//!   "saved_at": "2026-10-18T09:12:44.120+08:00",
//!   "messages": [
//!     { "role": "user", "content": "..." },
//!     { "role": "assistant", "content": "..." }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::providers::{ChatMessage, Role};

/// One transcript entry.
pub type Turn = ChatMessage;

/// What `load_from` found in a saved transcript file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTranscript {
    /// Timestamp recorded at save time, or `"unknown"` if absent.
    pub saved_at: String,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TranscriptFile {
    #[serde(default)]
    saved_at: Option<String>,
    #[serde(default)]
    messages: Vec<Turn>,
}

/// Ordered, append-only conversation history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSession {
    turns: Vec<Turn>,
}

impl ConversationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn::new(role, content));
    }

    /// The message list for the next request: the system turn, then every
    /// stored turn in order.
    pub fn build_request_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(self.turns.iter().cloned());
        messages
    }

    /// Content of the most recent assistant turn, or `""`.
    pub fn last_assistant_reply(&self) -> &str {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::Assistant)
            .map_or("", |turn| turn.content.as_str())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Writes the whole transcript to `path`, replacing any previous file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = TranscriptFile {
            saved_at: Some(Local::now().to_rfc3339()),
            messages: self.turns.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize transcript")?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, json)
            .with_context(|| format!("Failed to write transcript to {}", path.display()))?;

        tracing::debug!(path = %path.display(), turns = self.turns.len(), "saved transcript");
        Ok(())
    }

    /// Replaces the transcript with the one saved at `path`.
    ///
    /// On error the current transcript is left untouched.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a transcript.
    pub fn load_from(&mut self, path: &Path) -> Result<LoadedTranscript> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read transcript from {}", path.display()))?;
        let file: TranscriptFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse transcript from {}", path.display()))?;

        self.turns = file.messages;
        Ok(LoadedTranscript {
            saved_at: file.saved_at.unwrap_or_else(|| "unknown".to_string()),
            count: self.turns.len(),
        })
    }
}
