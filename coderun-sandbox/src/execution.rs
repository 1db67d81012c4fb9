//! Running one bounded step: spawn, feed stdin, capture, race the deadline

use crate::error::{Result, SandboxError};
use crate::sandbox::{exit_code_of, Invocation, Sandbox};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long readers may keep draining after the group was killed. Only a
/// descendant that escaped the group (setsid) can hold a pipe open longer.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Leader exited on its own; code is 128 + signal for signal deaths
    Exited(i32),
    /// Deadline fired first
    TimedOut,
    /// Cancellation token fired first
    Cancelled,
}

/// Captured result of one step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    /// Either stream hit the capture ceiling
    pub truncated: bool,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Background reader that keeps at most `limit` bytes and drains the rest
struct Capture {
    buffer: Arc<Mutex<Captured>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    let n = match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let mut captured = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    let room = limit.saturating_sub(captured.bytes.len());
                    if n > room {
                        captured.truncated = true;
                    }
                    let keep = n.min(room);
                    captured.bytes.extend_from_slice(&chunk[..keep]);
                }
            })
        });
        Self { buffer, task }
    }

    /// Wait briefly for EOF, then take whatever was read
    async fn finish(mut self) -> (String, bool) {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Output pipe still open after process group was killed");
                task.abort();
            }
        }
        let mut captured = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = std::mem::take(&mut captured.bytes);
        (String::from_utf8_lossy(&bytes).into_owned(), captured.truncated)
    }
}

/// Run one step to completion, deadline or cancellation.
///
/// `stdin` is written in full up front and then closed; `None` closes it
/// immediately. The deadline and the cancellation token race the process
/// exit, and whichever fires first decides the status. The process group
/// is killed afterwards in every case, so nothing the step started
/// outlives this call.
pub async fn run_step(
    sandbox: &dyn Sandbox,
    invocation: &Invocation<'_>,
    stdin: Option<&str>,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> Result<StepOutput> {
    let started = Instant::now();
    let mut child = sandbox.spawn(invocation)?;

    let writer = match (child.take_stdin(), stdin) {
        (Some(mut pipe), Some(input)) if !input.is_empty() => {
            let input = input.to_owned();
            Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    // The program may exit without reading its input
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::debug!(error = %e, "Failed to write stdin");
                    }
                }
            }))
        }
        _ => None,
    };
    let stdout = Capture::spawn(child.take_stdout(), max_output_bytes);
    let stderr = Capture::spawn(child.take_stderr(), max_output_bytes);

    let deadline = tokio::time::sleep(invocation.deadline);
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(StepStatus::Cancelled),
        _ = deadline => Ok(StepStatus::TimedOut),
        status = child.wait() => status.map(|s| StepStatus::Exited(exit_code_of(s))),
    };

    child.terminate().await;
    if let Some(writer) = writer {
        writer.abort();
    }
    let (stdout, stdout_truncated) = stdout.finish().await;
    let (stderr, stderr_truncated) = stderr.finish().await;

    let status = outcome.map_err(|e| {
        SandboxError::Internal(format!("Failed to wait for {}: {}", invocation.program(), e))
    })?;

    tracing::debug!(
        program = invocation.program(),
        status = ?status,
        duration_ms = started.elapsed().as_millis() as u64,
        "Step finished"
    );

    Ok(StepOutput {
        status,
        stdout,
        stderr,
        truncated: stdout_truncated || stderr_truncated,
        duration: started.elapsed(),
    })
}
