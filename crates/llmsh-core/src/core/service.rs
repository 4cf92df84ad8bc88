//! The inference service: one supervised server, one conversation.
//!
//! ```text
//! Stopped ──start──▶ Starting ──ready──▶ Ready
//!    ▲                  │                  │
//!    └──── failure ─────┘                  │
//!    └──── close / connection lost ────────┘
//! ```
//!
//! `Stopped` always means no server process is held.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{Config, RequestConfig, ServerConfig};
use crate::core::session::ConversationSession;
use crate::prompts::resolve_system_prompt;
use crate::providers::{ChatCompletionsClient, ClientError, Role};
use crate::server::{LaunchArgs, ProcessSupervisor, ReadinessProbe, ServerHandle, StartupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Ready,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Why a `send` produced no reply.
#[derive(Debug)]
pub enum SendError {
    /// The service is not `Ready`; nothing was sent or recorded.
    NotReady,
    Client(ClientError),
}

impl SendError {
    /// True when the server was lost and the service is now stopped.
    pub fn stopped_service(&self) -> bool {
        match self {
            SendError::NotReady => true,
            SendError::Client(err) => err.is_connection_lost(),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotReady => {
                write!(f, "LLM server is not running; start the server first")
            }
            SendError::Client(err) if err.is_connection_lost() => {
                write!(f, "{err} (server stopped; start it again to continue)")
            }
            SendError::Client(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::NotReady => None,
            SendError::Client(err) => Some(err),
        }
    }
}

impl From<ClientError> for SendError {
    fn from(err: ClientError) -> Self {
        SendError::Client(err)
    }
}

/// Holds the state at `Starting` while a start is in flight.
///
/// Unless marked ready, dropping it puts the state back to `Stopped`, so a
/// start that fails or whose future is dropped never leaves `Starting`
/// behind. The half-started [`ServerHandle`] is killed by its own `Drop`.
struct StartingGuard<'a> {
    state: &'a mut ServiceState,
}

impl<'a> StartingGuard<'a> {
    fn enter(state: &'a mut ServiceState) -> Self {
        *state = ServiceState::Starting;
        Self { state }
    }

    fn ready(&mut self) {
        *self.state = ServiceState::Ready;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if *self.state == ServiceState::Starting {
            *self.state = ServiceState::Stopped;
        }
    }
}

/// Composes supervisor, readiness probe, client and session behind
/// `start`/`send`/`close`.
///
/// The held [`ServerHandle`] kills its process group if the service is
/// dropped without `close`, so every exit path releases the server.
#[derive(Debug)]
pub struct InferenceService {
    server: ServerConfig,
    request: RequestConfig,
    system_prompt: String,
    supervisor: ProcessSupervisor,
    probe: ReadinessProbe,
    client: ChatCompletionsClient,
    session: ConversationSession,
    handle: Option<ServerHandle>,
    state: ServiceState,
}

impl InferenceService {
    /// Builds a stopped service from `config`.
    ///
    /// # Errors
    /// Returns an error if the HTTP clients cannot be constructed.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_supervisor(config, ProcessSupervisor::new())
    }

    /// # Errors
    /// Returns an error if the HTTP clients cannot be constructed.
    pub fn with_supervisor(config: &Config, supervisor: ProcessSupervisor) -> Result<Self> {
        let base_url = config.server.base_url();
        let probe =
            ReadinessProbe::new(&base_url).context("Failed to build health check client")?;
        let client =
            ChatCompletionsClient::new(&base_url).context("Failed to build completions client")?;

        Ok(Self {
            server: config.server.clone(),
            request: config.request,
            system_prompt: resolve_system_prompt(config.system_prompt.as_deref()),
            supervisor,
            probe,
            client,
            session: ConversationSession::new(),
            handle: None,
            state: ServiceState::Stopped,
        })
    }

    /// Overrides the delay between health checks.
    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe = self.probe.with_interval(interval);
        self
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ServiceState::Ready
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ServerHandle::pid)
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConversationSession {
        &mut self.session
    }

    /// Launches the server and waits until it answers health checks.
    ///
    /// Does nothing when already `Ready`. On failure the partially started
    /// process is torn down and the service is left `Stopped`.
    ///
    /// # Errors
    /// Any [`StartupError`].
    pub async fn start(&mut self) -> Result<(), StartupError> {
        if self.state == ServiceState::Ready {
            return Ok(());
        }
        let mut starting = StartingGuard::enter(&mut self.state);

        let args = LaunchArgs::from(&self.server);
        let model_name = args.model_path.file_name().map_or_else(
            || args.model_path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        tracing::info!(model = %model_name, address = %args.base_url(), "starting LLM server");

        let mut handle = self.supervisor.start(&args).inspect_err(|err| {
            tracing::error!(%err, "failed to start LLM server");
        })?;

        let timeout = self.server.readiness_timeout();
        if !self.probe.wait(timeout).await {
            tracing::error!(
                pid = handle.pid(),
                timeout_secs = timeout.as_secs(),
                "LLM server did not become ready"
            );
            ProcessSupervisor::terminate(&mut handle, self.server.shutdown_grace()).await;
            return Err(StartupError::ReadinessTimeout(timeout));
        }

        tracing::info!(pid = handle.pid(), "LLM server ready");
        self.handle = Some(handle);
        starting.ready();
        Ok(())
    }

    /// Sends `text` as the next user turn and returns the assistant reply.
    ///
    /// `on_delta` sees each streamed fragment as it arrives. The user turn is
    /// recorded before the request goes out; the assistant turn only on
    /// success. A lost connection stops the server and the service.
    ///
    /// # Errors
    /// `NotReady` without side effects when the service is not `Ready`;
    /// `Client` for request failures.
    pub async fn send<F>(&mut self, text: &str, on_delta: F) -> Result<String, SendError>
    where
        F: FnMut(&str),
    {
        if self.state != ServiceState::Ready {
            return Err(SendError::NotReady);
        }

        self.session.append(Role::User, text);
        let messages = self.session.build_request_messages(&self.system_prompt);

        match self.client.send(&messages, &self.request, on_delta).await {
            Ok(reply) => {
                self.session.append(Role::Assistant, reply.clone());
                Ok(reply)
            }
            Err(err) if err.is_connection_lost() => {
                tracing::error!(%err, "lost connection to LLM server; stopping it");
                self.release().await;
                self.state = ServiceState::Stopped;
                Err(SendError::Client(err))
            }
            Err(err) => {
                tracing::warn!(%err, "completion request failed");
                Err(SendError::Client(err))
            }
        }
    }

    /// Stops the server. Safe to call any number of times.
    pub async fn close(&mut self) {
        self.release().await;
        self.state = ServiceState::Stopped;
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            ProcessSupervisor::terminate(&mut handle, self.server.shutdown_grace()).await;
        }
    }
}
