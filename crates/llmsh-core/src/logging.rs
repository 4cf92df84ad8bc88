//! Tracing subscriber setup.
//!
//! Logs go to stderr, filtered by `LLMSH_LOG` (default `info`). When file
//! logging is enabled a daily-rotated copy is written under the logs dir.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the tracing filter directives.
pub const LOG_ENV_VAR: &str = "LLMSH_LOG";

const DEFAULT_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "llmsh.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber.
///
/// Returns the file writer guard when `log_dir` is given; keep it alive for
/// as long as logs should be flushed.
///
/// # Errors
/// Fails if the logs directory cannot be created or a subscriber is already set.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .try_init()
            .context("install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(Some(guard))
}
