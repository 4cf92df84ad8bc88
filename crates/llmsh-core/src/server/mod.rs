//! Supervision of the local llama-server process.

pub mod log_drain;
pub mod readiness;
pub mod supervisor;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use log_drain::{LogSink, OutputStream, TracingSink};
pub use readiness::{ReadinessProbe, wait_ready};
pub use supervisor::{LaunchArgs, ProcessSupervisor, ServerHandle, StartupError};
