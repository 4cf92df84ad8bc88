//! Core llmsh library (server supervision, chat client, session, config).

pub mod config;
pub mod core;
pub mod logging;
pub mod prompts;
pub mod providers;
pub mod server;
