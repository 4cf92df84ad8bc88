//! Continuous draining of the server's output pipes.
//!
//! llama-server writes verbose diagnostics; if nobody reads its pipes the
//! child eventually blocks on a full buffer. A drain task runs per pipe for
//! the lifetime of the process and forwards each line to a [`LogSink`].

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::Span;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Destination for lines read from the server's pipes.
pub trait LogSink: Send + Sync {
    fn line(&self, stream: OutputStream, line: &str);
}

/// Routes server output into `tracing` at debug level, inside a span that
/// identifies the owning server instance.
#[derive(Debug, Clone)]
pub struct TracingSink {
    span: Span,
}

impl TracingSink {
    pub fn new(pid: u32, port: u16) -> Self {
        Self {
            span: tracing::debug_span!(target: "llama_server", "llama_server", pid, port),
        }
    }
}

impl LogSink for TracingSink {
    fn line(&self, stream: OutputStream, line: &str) {
        let _entered = self.span.enter();
        tracing::debug!(target: "llama_server", stream = stream.as_str(), "{line}");
    }
}

/// Spawns a task that reads `reader` line by line into `sink`.
///
/// The task ends when the pipe closes or a read fails. Read failures are
/// logged, never propagated. Invalid UTF-8 is replaced rather than treated
/// as an error so the pipe keeps draining.
pub fn spawn<R>(reader: R, stream: OutputStream, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        sink.line(stream, line);
                    }
                }
                Err(err) => {
                    tracing::debug!(stream = stream.as_str(), %err, "server log drain stopped");
                    break;
                }
            }
        }
    })
}
