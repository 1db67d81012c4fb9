//! Interactive sessions: one long-lived run step with incremental I/O

use crate::error::{Result, SandboxError};
use crate::pipeline::{CompileOutcome, ExecutionPipeline};
use crate::registry::{Language, TemplateContext};
use crate::sandbox::{exit_code_of, Invocation, SandboxedChild};
use crate::workspace::Workspace;
use coderun_common::{CloseReason, SessionEvent, SessionId, SessionState, StreamKind};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Output pumps get this long to flush after the group is killed
const PUMP_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Final event delivery gives up after this long if nobody is reading
const FINAL_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 4096;

type SessionMap = RwLock<HashMap<SessionId, Arc<SessionSlot>>>;

/// Snapshot of one session for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: Language,
    pub state: SessionState,
    pub age: Duration,
}

/// Shared per-session state; the process itself is owned by the
/// supervisor task.
struct SessionSlot {
    id: SessionId,
    language: Language,
    opened_at: Instant,
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Fired to request teardown
    cancel: CancellationToken,
    /// Fired once teardown has finished
    done: CancellationToken,
}

impl SessionSlot {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a state-machine edge; illegal edges are ignored
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition_to(next) {
            tracing::debug!(session_id = %self.id, from = %*state, to = %next, "Session state change");
            *state = next;
            true
        } else {
            false
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First reason wins
    fn request_close(&self, reason: CloseReason) {
        let mut current = self.close_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(reason);
        }
        drop(current);
        self.cancel.cancel();
    }

    /// Cancellation without a recorded reason came from the manager itself
    fn close_reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(CloseReason::Shutdown)
    }

    fn invalid_state(&self, operation: &'static str) -> SandboxError {
        SandboxError::InvalidSessionState {
            id: self.id,
            state: self.state(),
            operation,
        }
    }
}

/// Removes a half-opened session if `open` is abandoned mid-way
struct OpenGuard {
    slot: Arc<SessionSlot>,
    sessions: Weak<SessionMap>,
    armed: bool,
}

impl OpenGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.slot.transition(SessionState::Failed);
        self.slot.done.cancel();
        if let Some(sessions) = self.sessions.upgrade() {
            sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.slot.id);
        }
    }
}

/// Owns every interactive session.
///
/// Sessions are independent; each runs one program with a piped stdin,
/// supervised by its own task that enforces the idle and lifetime
/// deadlines. Dropping the manager tears every session down.
pub struct SessionManager {
    pipeline: Arc<ExecutionPipeline>,
    sessions: Arc<SessionMap>,
    /// Parent of every session's cancel token
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(pipeline: Arc<ExecutionPipeline>) -> Self {
        Self {
            pipeline,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<ExecutionPipeline> {
        &self.pipeline
    }

    /// Compile (if needed) and start a program.
    ///
    /// A compile failure still yields a session id: the session is
    /// `Failed` and its output stream carries one `compile_failed` event.
    pub async fn open(&self, language: &str, source: &str) -> Result<SessionId> {
        let spec = self.pipeline.registry().resolve(language)?;
        let settings = self.pipeline.config().sessions.clone();

        let (events_tx, events_rx) = mpsc::channel(settings.output_buffer.max(1));
        let slot = Arc::new(SessionSlot {
            id: SessionId::new(),
            language: spec.language,
            opened_at: Instant::now(),
            state: Mutex::new(SessionState::Starting),
            stdin: tokio::sync::Mutex::new(None),
            events: Mutex::new(Some(events_rx)),
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            cancel: self.shutdown.child_token(),
            done: CancellationToken::new(),
        });
        let id = slot.id;

        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let live = sessions
                .values()
                .filter(|other| !other.state().is_terminal())
                .count();
            if live >= settings.max_sessions {
                return Err(SandboxError::ResourceExhausted(format!(
                    "{} interactive sessions already running",
                    live
                )));
            }
            sessions.insert(id, Arc::clone(&slot));
        }
        let guard = OpenGuard {
            slot: Arc::clone(&slot),
            sessions: Arc::downgrade(&self.sessions),
            armed: true,
        };

        tracing::info!(session_id = %id, language = %spec.language, "Opening session");

        let workspace = self.pipeline.prepare(&spec, source)?;

        if spec.is_compiled() {
            slot.transition(SessionState::Compiling);
        }
        let compiled = self.pipeline.compile(&spec, &workspace, &slot.cancel).await?;
        let failure = match compiled {
            CompileOutcome::Skipped | CompileOutcome::Succeeded => None,
            CompileOutcome::Failed { output, .. } => Some(SessionEvent::CompileFailed {
                output,
                timed_out: false,
            }),
            CompileOutcome::TimedOut => Some(SessionEvent::CompileFailed {
                output: "Compilation timed out".to_string(),
                timed_out: true,
            }),
            CompileOutcome::Cancelled => None,
        };

        if let Some(event) = failure {
            tracing::info!(session_id = %id, "Session failed to compile");
            workspace.destroy();
            slot.transition(SessionState::Failed);
            // Capacity is at least one and nothing else has sent yet
            let _ = events_tx.try_send(event);
            drop(events_tx);
            slot.done.cancel();
            self.schedule_eviction(id, settings.closed_retention);
            guard.disarm();
            return Ok(id);
        }

        if slot.cancel.is_cancelled() {
            workspace.destroy();
            slot.transition(SessionState::Closed);
            let _ = events_tx.try_send(SessionEvent::Closed {
                reason: slot.close_reason(),
            });
            slot.done.cancel();
            self.schedule_eviction(id, settings.closed_retention);
            guard.disarm();
            return Err(SandboxError::Cancelled);
        }

        let limits = &self.pipeline.config().sandbox.run_limits;
        let argv = spec.run.render(&TemplateContext {
            memory_mb: limits.memory_mb(),
        });
        let mut child = self.pipeline.sandbox().spawn(&Invocation {
            argv: &argv,
            workdir: workspace.path(),
            limits,
            enforce_address_space: spec.enforce_address_space,
            deadline: settings.max_lifetime,
        })?;

        *slot.stdin.lock().await = child.take_stdin();
        let pumps = vec![
            spawn_pump(child.take_stdout(), StreamKind::Stdout, events_tx.clone(), Arc::clone(&slot)),
            spawn_pump(child.take_stderr(), StreamKind::Stderr, events_tx.clone(), Arc::clone(&slot)),
        ];
        slot.touch();
        slot.transition(SessionState::Running);

        let supervisor = Supervisor {
            slot: Arc::clone(&slot),
            child,
            workspace,
            pumps,
            events: events_tx,
            idle_timeout: settings.idle_timeout,
            lifetime_deadline: slot.opened_at + settings.max_lifetime,
            retention: settings.closed_retention,
            sessions: Arc::downgrade(&self.sessions),
        };
        tokio::spawn(supervisor.run());

        guard.disarm();
        tracing::info!(session_id = %id, "Session running");
        Ok(id)
    }

    /// Append `text` plus a newline to the program's stdin
    pub async fn send_input(&self, id: SessionId, text: &str) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.state() != SessionState::Running {
            return Err(slot.invalid_state("send input"));
        }

        let mut stdin = slot.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(slot.invalid_state("send input after end of input"));
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                slot.touch();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // The program is gone; the supervisor is about to close the session
                *stdin = None;
                Err(SandboxError::InvalidSessionState {
                    id,
                    state: SessionState::Closed,
                    operation: "send input to an exited program",
                })
            }
            Err(e) => Err(SandboxError::Internal(format!(
                "Failed to write to session {}: {}",
                id, e
            ))),
        }
    }

    /// Close the program's stdin, leaving it running
    pub async fn close_input(&self, id: SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.state() != SessionState::Running {
            return Err(slot.invalid_state("close input"));
        }
        slot.stdin.lock().await.take();
        slot.touch();
        Ok(())
    }

    /// Take the session's event stream. Only one consumer per session.
    ///
    /// The stream ends after the terminal event (`compile_failed`,
    /// `exited` or `closed`).
    pub fn receive_output(&self, id: SessionId) -> Result<ReceiverStream<SessionEvent>> {
        let slot = self.slot(id)?;
        let receiver = slot
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        receiver
            .map(ReceiverStream::new)
            .ok_or_else(|| slot.invalid_state("receive output twice"))
    }

    /// Terminate the session and wait for teardown. Idempotent.
    pub async fn close(&self, id: SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        if !slot.state().is_terminal() {
            tracing::info!(session_id = %id, "Closing session");
            slot.request_close(CloseReason::Requested);
        }
        slot.done.cancelled().await;
        Ok(())
    }

    pub fn state(&self, id: SessionId) -> Result<SessionState> {
        Ok(self.slot(id)?.state())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|slot| SessionInfo {
                id: slot.id,
                language: slot.language,
                state: slot.state(),
                age: slot.opened_at.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }

    /// Close every live session and wait until all are torn down
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<SessionSlot>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if slots.is_empty() {
            return;
        }
        tracing::info!(sessions = slots.len(), "Shutting down sessions");
        for slot in &slots {
            if !slot.state().is_terminal() {
                slot.request_close(CloseReason::Shutdown);
            }
        }
        for slot in slots {
            slot.done.cancelled().await;
        }
    }

    fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(SandboxError::SessionNotFound(id))
    }

    fn schedule_eviction(&self, id: SessionId, retention: Duration) {
        schedule_eviction(Arc::downgrade(&self.sessions), id, retention);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn schedule_eviction(sessions: Weak<SessionMap>, id: SessionId, retention: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        if let Some(sessions) = sessions.upgrade() {
            sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            tracing::debug!(session_id = %id, "Evicted session");
        }
    });
}

/// Forward one pipe as `output` events, keeping multi-byte characters
/// intact across reads. Keeps draining after the consumer went away so
/// the program never blocks on a full pipe.
fn spawn_pump<R>(
    reader: Option<R>,
    stream: StreamKind,
    events: mpsc::Sender<SessionEvent>,
    slot: Arc<SessionSlot>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending = Vec::new();
        let mut consumer_gone = false;
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            slot.touch();
            if consumer_gone {
                continue;
            }
            pending.extend_from_slice(&chunk[..n]);
            let data = take_utf8(&mut pending);
            if data.is_empty() {
                continue;
            }
            if events.send(SessionEvent::Output { stream, data }).await.is_err() {
                consumer_gone = true;
            }
        }
        if !pending.is_empty() && !consumer_gone {
            let data = String::from_utf8_lossy(&pending).into_owned();
            let _ = events.send(SessionEvent::Output { stream, data }).await;
        }
    })
}

/// Decode the longest complete prefix, leaving a split character's
/// leading bytes in `pending`.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    Closed(CloseReason),
}

/// Owns the process and workspace of one running session
struct Supervisor {
    slot: Arc<SessionSlot>,
    child: SandboxedChild,
    workspace: Workspace,
    pumps: Vec<JoinHandle<()>>,
    events: mpsc::Sender<SessionEvent>,
    idle_timeout: Duration,
    lifetime_deadline: Instant,
    retention: Duration,
    sessions: Weak<SessionMap>,
}

impl Supervisor {
    async fn run(mut self) {
        let id = self.slot.id;
        let ending = loop {
            let idle_deadline = self.slot.last_activity() + self.idle_timeout;
            tokio::select! {
                biased;
                _ = self.slot.cancel.cancelled() => break Ending::Closed(self.slot.close_reason()),
                status = self.child.wait() => break Ending::Exited(status),
                _ = tokio::time::sleep_until(self.lifetime_deadline) => {
                    break Ending::Closed(CloseReason::LifetimeExceeded)
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    if self.slot.last_activity() + self.idle_timeout <= Instant::now() {
                        break Ending::Closed(CloseReason::IdleTimeout);
                    }
                }
            }
        };

        self.child.terminate().await;
        self.slot.stdin.lock().await.take();
        for pump in &mut self.pumps {
            if tokio::time::timeout(PUMP_DRAIN_GRACE, &mut *pump).await.is_err() {
                pump.abort();
            }
        }
        self.workspace.destroy();

        let (state, event) = match ending {
            Ending::Exited(Ok(status)) => {
                let exit_code = exit_code_of(status);
                tracing::info!(session_id = %id, exit_code, "Session program exited");
                // A program killed by a signal crashed rather than finished
                let state = if status.signal().is_some() {
                    SessionState::Failed
                } else {
                    SessionState::Closed
                };
                (state, SessionEvent::Exited { exit_code })
            }
            Ending::Exited(Err(e)) => {
                tracing::error!(session_id = %id, error = %e, "Failed to wait for session program");
                (
                    SessionState::Failed,
                    SessionEvent::Closed {
                        reason: CloseReason::Shutdown,
                    },
                )
            }
            Ending::Closed(reason) => {
                tracing::info!(session_id = %id, reason = ?reason, "Session closed");
                (SessionState::Closed, SessionEvent::Closed { reason })
            }
        };
        self.slot.transition(state);

        if tokio::time::timeout(FINAL_EVENT_TIMEOUT, self.events.send(event))
            .await
            .is_err()
        {
            tracing::debug!(session_id = %id, "Final session event dropped; consumer is not reading");
        }
        drop(self.events);

        self.slot.done.cancel();
        schedule_eviction(self.sessions, id, self.retention);
    }
}
