//! Configuration management for llmsh.
//!
//! Loads configuration from ${LLMSH_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Returns the default config template with comments.
///
/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! LLMSH_HOME resolution order:
    //! 1. LLMSH_HOME environment variable (if set)
    //! 2. ~/.config/llmsh (default)
    //! 3. ./.llmsh when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the llmsh home directory.
    pub fn llmsh_home() -> PathBuf {
        if let Ok(home) = std::env::var("LLMSH_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".llmsh"),
            |h| h.join(".config").join("llmsh"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        llmsh_home().join("config.toml")
    }

    /// Returns the default conversation history file.
    pub fn history_path() -> PathBuf {
        llmsh_home().join("chat_history.json")
    }

    /// Returns the directory for rotated log files.
    pub fn logs_dir() -> PathBuf {
        llmsh_home().join("logs")
    }
}

/// Launch and supervision settings for the local inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable: a path, or a bare name resolved against `PATH`.
    pub executable: PathBuf,
    /// GGUF model file passed as `-m`.
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Context window size in tokens (`-c`).
    pub context_size: u32,
    /// Layers offloaded to the GPU (`-ngl`).
    pub gpu_layers: u32,
    pub readiness_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub const DEFAULT_EXECUTABLE: &'static str = "llama-server";
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
    pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

    /// Base URL of the server's HTTP API, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(Self::DEFAULT_EXECUTABLE),
            model_path: PathBuf::new(),
            host: Self::DEFAULT_HOST.to_string(),
            port: Self::DEFAULT_PORT,
            context_size: Self::DEFAULT_CONTEXT_SIZE,
            gpu_layers: 0,
            readiness_timeout_secs: Self::DEFAULT_READINESS_TIMEOUT_SECS,
            shutdown_grace_secs: Self::DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

/// Per-request sampling settings for chat completions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Stream the reply as server-sent events instead of one JSON body.
    pub stream: bool,
}

impl RequestConfig {
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_MAX_TOKENS: u32 = 512;
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            stream: true,
        }
    }
}

/// Top-level llmsh configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Optional system prompt override
    pub system_prompt: Option<String>,

    /// Also write logs to a daily-rotated file under the logs directory
    pub log_to_file: bool,

    pub server: ServerConfig,

    pub request: RequestConfig,
}

impl Config {
    /// Loads configuration from the default path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default config to `path`.
    ///
    /// # Errors
    /// Fails if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.request.max_tokens, 512);
        assert!((config.request.temperature - 0.7).abs() < f32::EPSILON);
        assert!(config.request.stream);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 9090\nmodel_path = \"/models/qwen.gguf\"\n\n[request]\nstream = false\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.model_path, PathBuf::from("/models/qwen.gguf"));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(5));
        assert!(!config.request.stream);
        assert_eq!(config.request.max_tokens, 512);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn test_default_template_parses_to_defaults() {
        let parsed: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::init(&path).unwrap();
        assert!(path.exists());

        let err = Config::init(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
