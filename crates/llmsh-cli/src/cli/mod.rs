//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use llmsh_core::config::{self, Config};
use llmsh_core::core::interrupt;
use llmsh_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "llmsh")]
#[command(version = "0.1")]
#[command(about = "Chat with a local llama-server from the shell")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server: ServerArgs,

    /// Print the whole reply at once instead of streaming it
    #[arg(long = "no-stream")]
    no_stream: bool,

    /// Override the system prompt from config
    #[arg(long)]
    system_prompt: Option<String>,
}

/// Server launch overrides; unset flags keep the config values.
#[derive(clap::Args, Debug, Clone, Default)]
struct ServerArgs {
    /// GGUF model file to serve
    #[arg(short, long, env = "LLMSH_MODEL", value_name = "PATH")]
    model: Option<PathBuf>,

    /// llama-server executable (path or name on PATH)
    #[arg(long, env = "LLMSH_SERVER", value_name = "PATH")]
    server: Option<PathBuf>,

    /// Address the server binds to
    #[arg(long)]
    host: Option<String>,

    /// Port the server listens on
    #[arg(long)]
    port: Option<u16>,

    /// Context window size in tokens
    #[arg(long = "ctx-size", value_name = "TOKENS")]
    ctx_size: Option<u32>,

    /// Layers offloaded to the GPU
    #[arg(long = "gpu-layers", value_name = "N")]
    gpu_layers: Option<u32>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        server,
        no_stream,
        system_prompt,
    } = cli;

    if let Some(command) = command {
        return match command {
            Commands::Config { command } => match command {
                ConfigCommands::Path => {
                    commands::config::path();
                    Ok(())
                }
                ConfigCommands::Init => commands::config::init(),
            },
        };
    }

    let mut config = Config::load().context("load config")?;
    apply_overrides(&mut config, &server, no_stream, system_prompt.as_deref());

    let log_dir = config.log_to_file.then(config::paths::logs_dir);
    let _log_guard = logging::init(log_dir.as_deref()).context("init logging")?;
    interrupt::init()?;

    commands::chat::run(&config).await
}

fn apply_overrides(
    config: &mut Config,
    server: &ServerArgs,
    no_stream: bool,
    system_prompt: Option<&str>,
) {
    if let Some(model) = &server.model {
        config.server.model_path.clone_from(model);
    }
    if let Some(executable) = &server.server {
        config.server.executable.clone_from(executable);
    }
    if let Some(host) = &server.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = server.port {
        config.server.port = port;
    }
    if let Some(ctx_size) = server.ctx_size {
        config.server.context_size = ctx_size;
    }
    if let Some(gpu_layers) = server.gpu_layers {
        config.server.gpu_layers = gpu_layers;
    }
    if no_stream {
        config.request.stream = false;
    }
    if let Some(sp) = system_prompt {
        let trimmed = sp.trim();
        config.system_prompt = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
}
