//! Fake server executables for process tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use super::supervisor::{LaunchArgs, ProcessSupervisor, ServerHandle, StartupError};

/// A shell script standing in for llama-server, plus a dummy model file.
pub(crate) struct FakeServer {
    pub dir: TempDir,
    pub executable: PathBuf,
    pub model: PathBuf,
}

impl FakeServer {
    /// Writes `body` (after a `#!/bin/sh` line) as an executable script.
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let executable = dir.path().join("llama-server");
        std::fs::write(&executable, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        Self {
            dir,
            executable,
            model,
        }
    }

    /// A server that does nothing but stay alive.
    pub fn sleeping() -> Self {
        Self::new("exec sleep 60\n")
    }

    /// A server that records its pid next to the script, then sleeps.
    pub fn recording_pid() -> Self {
        Self::new("echo $$ > \"$(dirname \"$0\")/server.pid\"\nexec sleep 60\n")
    }

    pub fn launch_args(dir: &TempDir, model: &Path, port: u16) -> LaunchArgs {
        LaunchArgs {
            executable: dir.path().join("llama-server"),
            model_path: model.to_path_buf(),
            host: "127.0.0.1".to_string(),
            port,
            context_size: 2048,
            gpu_layers: 0,
        }
    }

    pub fn launch_args_for(&self, port: u16) -> LaunchArgs {
        Self::launch_args(&self.dir, &self.model, port)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("server.pid")
    }

    /// Starts the script, retrying while the freshly written file is still
    /// busy for exec in a concurrently forking test process.
    pub async fn start(&self, supervisor: &ProcessSupervisor, args: &LaunchArgs) -> ServerHandle {
        let mut attempts = 0;
        loop {
            match supervisor.start(args) {
                Ok(handle) => return handle,
                Err(StartupError::SpawnFailure(msg)) if attempts < 10 && msg.contains("busy") => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => panic!("fake server failed to start: {err}"),
            }
        }
    }
}

/// True when `pid` no longer names a live process (zombies count as gone).
pub(crate) fn process_gone(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Polls `condition` every 20ms until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
