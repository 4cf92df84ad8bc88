//! Built-in prompts.

/// System prompt sent ahead of every conversation unless overridden in config.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a smart command-line assistant running on a Linux system. \
You help the user understand the output of system commands, analyze file contents and explain code. \
Keep your answers concise and clear.";

/// Picks the configured system prompt, falling back to the built-in one.
///
/// Blank overrides count as unset.
pub fn resolve_system_prompt(configured: Option<&str>) -> String {
    match configured {
        Some(prompt) if !prompt.trim().is_empty() => prompt.trim().to_string(),
        _ => DEFAULT_SYSTEM_PROMPT.to_string(),
    }
}
