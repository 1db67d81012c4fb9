//! Owned handle over a sandboxed process tree

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Named container backing a child, killed through the container CLI
#[derive(Debug, Clone)]
pub(crate) struct ContainerHandle {
    pub binary: String,
    pub name: String,
}

/// A spawned step whose whole process group dies with the handle.
///
/// The child is the leader of its own process group, so one `killpg`
/// reaches every descendant that did not start a new session. Dropping
/// the handle without calling [`SandboxedChild::terminate`] still sends
/// SIGKILL to the group (and `kill` to the container, if any).
#[derive(Debug)]
pub struct SandboxedChild {
    child: Child,
    pgid: Option<Pid>,
    container: Option<ContainerHandle>,
    label: String,
    terminated: bool,
}

impl SandboxedChild {
    pub(crate) fn new(child: Child, label: impl Into<String>) -> Self {
        let pgid = child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw);
        Self {
            child,
            pgid,
            container: None,
            label: label.into(),
            terminated: false,
        }
    }

    pub(crate) fn with_container(mut self, container: ContainerHandle) -> Self {
        self.container = Some(container);
        self
    }

    /// OS pid of the group leader, if it has not been reaped yet
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid.map(Pid::as_raw)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the group leader to exit. Cancel-safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGKILL the whole process group. Already-empty groups are fine.
    pub fn kill_group(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(pgid = pgid.as_raw(), step = %self.label, error = %err, "Failed to signal process group");
            }
        }
    }

    /// Kill the group (and container), then reap the leader.
    ///
    /// Safe to call after the leader has exited on its own: descendants it
    /// left behind in the group are killed too.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        self.kill_group();
        if let Some(container) = &self.container {
            kill_container(container).await;
        }
        self.terminated = true;
        match self.child.wait().await {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(step = %self.label, error = %err, "Failed to reap child");
                None
            }
        }
    }
}

impl Drop for SandboxedChild {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        tracing::debug!(step = %self.label, pgid = ?self.pgid(), "Killing abandoned process group");
        self.kill_group();
        if let Some(container) = self.container.take() {
            // Drop may run outside a runtime; the CLI call blocks, so keep it off this thread.
            std::thread::spawn(move || {
                let _ = std::process::Command::new(&container.binary)
                    .args(["kill", &container.name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            });
        }
    }
}

async fn kill_container(container: &ContainerHandle) {
    let status = tokio::process::Command::new(&container.binary)
        .args(["kill", &container.name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(CONTAINER_KILL_TIMEOUT, status).await {
        // Non-zero means the container already exited and was removed
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            tracing::warn!(container = %container.name, error = %err, "Failed to run container kill");
        }
        Err(_) => {
            tracing::warn!(container = %container.name, "Container kill timed out");
        }
    }
}

/// Process exit code, with signal deaths reported as 128 + signal number
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|signal| 128 + signal).unwrap_or(-1),
    }
}
