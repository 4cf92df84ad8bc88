//! Spawning and terminating the llama-server process.
//!
//! The server is launched as the leader of its own process group so that
//! termination can signal it together with anything it spawned. Shutdown
//! sends SIGTERM to the group, waits for a grace period, then SIGKILLs the
//! group: a server busy loading a large model may ignore SIGTERM.
//!
//! Platforms without process groups fall back to killing the tracked child.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::log_drain::{self, LogSink, OutputStream, TracingSink};
use crate::config::ServerConfig;

/// How long to wait for drain tasks once the process is gone.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to build the server command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub executable: PathBuf,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub context_size: u32,
    pub gpu_layers: u32,
}

impl LaunchArgs {
    /// Arguments passed after the executable:
    /// `-m <model> --host <host> --port <port> -c <ctx> -ngl <layers>`.
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            "-m".into(),
            self.model_path.clone().into_os_string(),
            "--host".into(),
            self.host.clone().into(),
            "--port".into(),
            self.port.to_string().into(),
            "-c".into(),
            self.context_size.to_string().into(),
            "-ngl".into(),
            self.gpu_layers.to_string().into(),
        ]
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl From<&ServerConfig> for LaunchArgs {
    fn from(config: &ServerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            model_path: config.model_path.clone(),
            host: config.host.clone(),
            port: config.port,
            context_size: config.context_size,
            gpu_layers: config.gpu_layers,
        }
    }
}

/// Reasons `start` can fail. All of them leave no server running.
#[derive(Debug)]
pub enum StartupError {
    ExecutableNotFound(PathBuf),
    ModelNotFound(PathBuf),
    SpawnFailure(String),
    ReadinessTimeout(Duration),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::ExecutableNotFound(path) => {
                write!(f, "llama-server executable not found: {}", path.display())
            }
            StartupError::ModelNotFound(path) => {
                write!(f, "model file not found: {}", path.display())
            }
            StartupError::SpawnFailure(message) => {
                write!(f, "failed to launch llama-server: {message}")
            }
            StartupError::ReadinessTimeout(timeout) => write!(
                f,
                "llama-server did not become ready within {}s",
                timeout.as_secs()
            ),
        }
    }
}

impl std::error::Error for StartupError {}

/// A running server process and the tasks draining its output.
///
/// Dropping a handle that was never terminated kills the whole process
/// group immediately.
pub struct ServerHandle {
    pid: u32,
    pgid: u32,
    alive: bool,
    child: Child,
    drains: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    /// False once the handle has been terminated.
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        tracing::warn!(pid = self.pid, "server handle dropped while running; killing");
        force_kill(self);
        for drain in &self.drains {
            drain.abort();
        }
    }
}

/// Launches and tears down server processes.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

impl ProcessSupervisor {
    /// Supervisor whose servers log through a per-instance [`TracingSink`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervisor that sends every server's output to `sink`.
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Spawns the server described by `args` and starts draining its output.
    ///
    /// # Errors
    /// `ExecutableNotFound` / `ModelNotFound` when the files are missing,
    /// `SpawnFailure` for any other launch error.
    pub fn start(&self, args: &LaunchArgs) -> Result<ServerHandle, StartupError> {
        let executable = resolve_executable(&args.executable)
            .ok_or_else(|| StartupError::ExecutableNotFound(args.executable.clone()))?;
        if !args.model_path.is_file() {
            return Err(StartupError::ModelNotFound(args.model_path.clone()));
        }

        let mut std_command = std::process::Command::new(&executable);
        std_command
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StartupError::ExecutableNotFound(executable.clone())
            } else {
                StartupError::SpawnFailure(format!("{}: {e}", executable.display()))
            }
        })?;

        let Some(pid) = child.id() else {
            return Err(StartupError::SpawnFailure(
                "process exited before its pid could be read".to_string(),
            ));
        };
        let pgid = process_group_of(pid);

        let sink = self
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink::new(pid, args.port)));
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(log_drain::spawn(stdout, OutputStream::Stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(log_drain::spawn(stderr, OutputStream::Stderr, sink));
        }

        tracing::debug!(pid, pgid, executable = %executable.display(), "spawned llama-server");

        Ok(ServerHandle {
            pid,
            pgid,
            alive: true,
            child,
            drains,
        })
    }

    /// Stops the server's process group: SIGTERM, wait up to `grace`, then
    /// SIGKILL and wait unconditionally.
    ///
    /// No-op on a handle that was already terminated. Failures are logged;
    /// the handle is always left terminated.
    pub async fn terminate(handle: &mut ServerHandle, grace: Duration) {
        if !handle.alive {
            return;
        }
        let pid = handle.pid;
        tracing::info!(pid, "stopping LLM server");

        if let Err(err) = request_stop(handle) {
            tracing::warn!(pid, %err, "failed to signal server; killing");
            force_kill(handle);
        }

        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid, %status, "server exited"),
            Ok(Err(err)) => {
                tracing::warn!(pid, %err, "waiting for server failed; killing");
                force_kill(handle);
                if let Err(err) = handle.child.wait().await {
                    tracing::error!(pid, %err, "could not reap server process");
                }
            }
            Err(_) => {
                tracing::warn!(pid, grace_secs = grace.as_secs_f32(), "server ignored SIGTERM; killing");
                force_kill(handle);
                match handle.child.wait().await {
                    Ok(status) => tracing::debug!(pid, %status, "server killed"),
                    Err(err) => tracing::error!(pid, %err, "could not reap server process"),
                }
            }
        }

        // Descendants that outlived the leader still share its group.
        force_kill(handle);
        handle.alive = false;

        for drain in handle.drains.drain(..) {
            let abort = drain.abort_handle();
            if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, drain).await.is_err() {
                abort.abort();
            }
        }

        tracing::info!(pid, "LLM server stopped");
    }
}

/// Resolves `executable` to an existing file, searching `PATH` for bare names.
pub fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.as_os_str().is_empty() {
        return None;
    }
    if executable.components().count() > 1 || executable.is_absolute() {
        return executable.is_file().then(|| executable.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn process_group_of(pid: u32) -> u32 {
    // SAFETY: getpgid only reads kernel state for the given pid.
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid > 0 { pgid as u32 } else { pid }
}

#[cfg(not(unix))]
fn process_group_of(pid: u32) -> u32 {
    pid
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions; a negative pid
    // addresses the process group.
    let result = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Group already gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(unix)]
fn request_stop(handle: &mut ServerHandle) -> std::io::Result<()> {
    signal_group(handle.pgid, libc::SIGTERM)
}

#[cfg(not(unix))]
fn request_stop(handle: &mut ServerHandle) -> std::io::Result<()> {
    handle.child.start_kill()
}

fn force_kill(handle: &mut ServerHandle) {
    #[cfg(unix)]
    if let Err(err) = signal_group(handle.pgid, libc::SIGKILL) {
        tracing::debug!(pgid = handle.pgid, %err, "SIGKILL to process group failed");
    }
    // Errors here mean the child was already reaped.
    let _ = handle.child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::server::testing::{FakeServer, process_gone, wait_until};

    #[derive(Default)]
    struct CollectingSink {
        lines: Mutex<Vec<(OutputStream, String)>>,
    }

    impl LogSink for CollectingSink {
        fn line(&self, stream: OutputStream, line: &str) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }
    }

    #[test]
    fn test_launch_args_order() {
        let args = LaunchArgs {
            executable: PathBuf::from("llama-server"),
            model_path: PathBuf::from("/models/q.gguf"),
            host: "127.0.0.1".to_string(),
            port: 8081,
            context_size: 4096,
            gpu_layers: 33,
        };
        let rendered: Vec<String> = args
            .to_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            rendered,
            [
                "-m", "/models/q.gguf", "--host", "127.0.0.1", "--port", "8081", "-c", "4096",
                "-ngl", "33"
            ]
        );
        assert_eq!(args.base_url(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_resolve_executable_searches_path() {
        assert!(resolve_executable(Path::new("sh")).is_some());
        assert!(resolve_executable(Path::new("definitely-not-a-real-binary-xyz")).is_none());
        assert!(resolve_executable(Path::new("/no/such/dir/llama-server")).is_none());
        assert!(resolve_executable(Path::new("")).is_none());
    }

    #[tokio::test]
    async fn test_start_reports_missing_executable() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"gguf").unwrap();
        let args = LaunchArgs {
            executable: dir.path().join("llama-server"),
            ..FakeServer::launch_args(&dir, &model, 8080)
        };

        let err = ProcessSupervisor::new().start(&args).unwrap_err();
        assert!(matches!(err, StartupError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_reports_missing_model() {
        let fake = FakeServer::sleeping();
        let args = LaunchArgs {
            model_path: fake.dir.path().join("missing.gguf"),
            ..fake.launch_args_for(8080)
        };

        let err = ProcessSupervisor::new().start(&args).unwrap_err();
        assert!(matches!(err, StartupError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_passes_launch_arguments() {
        let fake = FakeServer::new("echo \"$@\" > \"$(dirname \"$0\")/args.txt\"\nexec sleep 30\n");
        let args = fake.launch_args_for(9123);
        let args_file = fake.dir.path().join("args.txt");

        let mut handle = fake.start(&ProcessSupervisor::new(), &args).await;
        assert!(wait_until(Duration::from_secs(5), || args_file.exists()).await);
        let recorded = std::fs::read_to_string(&args_file).unwrap();
        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(2)).await;

        assert_eq!(
            recorded.trim(),
            format!(
                "-m {} --host 127.0.0.1 --port 9123 -c 2048 -ngl 0",
                fake.model.display()
            )
        );
    }

    #[tokio::test]
    async fn test_server_is_its_own_process_group_leader() {
        let fake = FakeServer::sleeping();
        let mut handle = fake
            .start(&ProcessSupervisor::new(), &fake.launch_args_for(8080))
            .await;

        assert_eq!(handle.pgid(), handle.pid());
        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_terminate_graceful_is_idempotent() {
        let fake = FakeServer::sleeping();
        let mut handle = fake
            .start(&ProcessSupervisor::new(), &fake.launch_args_for(8080))
            .await;
        let pid = handle.pid();

        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(5)).await;
        assert!(!handle.is_alive());
        assert!(process_gone(pid));

        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(5)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        // The ignored disposition survives exec, so sleep ignores SIGTERM.
        let fake = FakeServer::new(
            "trap '' TERM\ntouch \"$(dirname \"$0\")/trapped\"\nexec sleep 30\n",
        );
        let trapped = fake.dir.path().join("trapped");
        let mut handle = fake
            .start(&ProcessSupervisor::new(), &fake.launch_args_for(8080))
            .await;
        let pid = handle.pid();
        let pgid = handle.pgid();
        // SIGTERM must arrive after the trap is installed.
        assert!(wait_until(Duration::from_secs(5), || trapped.exists()).await);

        let started = std::time::Instant::now();
        ProcessSupervisor::terminate(&mut handle, Duration::from_millis(300)).await;

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(process_gone(pid));
        // SAFETY: signal 0 only checks that the group exists.
        assert_eq!(unsafe { libc::kill(-(pgid as libc::pid_t), 0) }, -1);
    }

    #[tokio::test]
    async fn test_terminate_kills_descendants_in_group() {
        let fake = FakeServer::new(
            "sleep 30 &\necho $! > \"$(dirname \"$0\")/child.pid\"\nwait\n",
        );
        let child_file = fake.dir.path().join("child.pid");
        let mut handle = fake
            .start(&ProcessSupervisor::new(), &fake.launch_args_for(8080))
            .await;
        assert!(wait_until(Duration::from_secs(5), || child_file.exists()).await);
        let descendant: u32 = std::fs::read_to_string(&child_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(2)).await;

        assert!(wait_until(Duration::from_secs(5), || process_gone(descendant)).await);
    }

    #[tokio::test]
    async fn test_output_is_drained_into_sink() {
        let fake = FakeServer::new("echo listening\necho 'model loaded' >&2\nexec sleep 30\n");
        let sink = Arc::new(CollectingSink::default());
        let supervisor = ProcessSupervisor::with_sink(sink.clone());
        let mut handle = fake.start(&supervisor, &fake.launch_args_for(8080)).await;

        let seen = wait_until(Duration::from_secs(5), || sink.lines.lock().unwrap().len() == 2).await;
        ProcessSupervisor::terminate(&mut handle, Duration::from_secs(2)).await;

        assert!(seen);
        let lines = sink.lines.lock().unwrap();
        assert!(lines.contains(&(OutputStream::Stdout, "listening".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "model loaded".to_string())));
    }

    #[tokio::test]
    async fn test_dropping_live_handle_kills_server() {
        let fake = FakeServer::sleeping();
        let handle = fake
            .start(&ProcessSupervisor::new(), &fake.launch_args_for(8080))
            .await;
        let pid = handle.pid();

        drop(handle);

        assert!(wait_until(Duration::from_secs(5), || process_gone(pid)).await);
    }
}
