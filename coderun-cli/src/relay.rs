//! Line-delimited JSON relay between a duplex byte stream and the engine
//!
//! Every input line is one [`ClientEnvelope`]; every output line is one
//! [`ServerEnvelope`]. Replies echo the request's `correlation_id`.

use anyhow::{Context, Result};
use coderun_common::{
    ClientEnvelope, ClientFrame, ServerEnvelope, ServerFrame, SessionId, SessionState,
};
use coderun_sandbox::{ExecutionBackend, SandboxError, SessionManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const OUTBOUND_BUFFER: usize = 256;

/// Input frames a session may have queued behind a slow reader
const INPUT_QUEUE: usize = 64;

type Outbound = mpsc::Sender<ServerEnvelope>;

/// Per-session input queues, registered before `opened` is announced
type InputQueues = Arc<Mutex<HashMap<SessionId, mpsc::Sender<QueuedInput>>>>;

enum InputCommand {
    Line(String),
    Eof,
}

struct QueuedInput {
    command: InputCommand,
    correlation_id: Option<Uuid>,
}

fn queues(inputs: &InputQueues) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<QueuedInput>>> {
    inputs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serve frames from `input` until it reaches EOF.
///
/// Batch executions and session openings run concurrently. Each session's
/// input is queued and written in arrival order by its own task, so a
/// program that stops reading stdin only holds up its own input. When
/// `input` ends every open session is closed and pending replies are
/// flushed before returning.
pub async fn run_relay<R, W>(
    manager: Arc<SessionManager>,
    backend: Arc<dyn ExecutionBackend>,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_frames(output, rx));

    let mut relay = Relay {
        manager: Arc::clone(&manager),
        backend,
        tx,
        tasks: JoinSet::new(),
        closing: CancellationToken::new(),
        inputs: InputQueues::default(),
    };

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read relay input")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientEnvelope>(&line) {
            Ok(envelope) => relay.handle(envelope).await,
            Err(e) => {
                debug!("Rejected relay frame: {}", e);
                relay
                    .reply(
                        None,
                        ServerFrame::Error {
                            message: format!("Invalid frame: {}", e),
                            session_id: None,
                        },
                    )
                    .await;
            }
        }
        // Reap finished tasks so the set doesn't grow without bound
        while let Some(joined) = relay.tasks.try_join_next() {
            if let Err(e) = joined {
                warn!("Relay task failed: {}", e);
            }
        }
    }

    // Sessions still being opened see `closing` and shut themselves
    relay.closing.cancel();
    manager.shutdown().await;
    // Forwarders finish once their sessions emit the terminal event
    while let Some(joined) = relay.tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Relay task failed: {}", e);
        }
    }
    drop(relay);
    writer.await.context("Relay writer panicked")?
}

struct Relay {
    manager: Arc<SessionManager>,
    backend: Arc<dyn ExecutionBackend>,
    tx: Outbound,
    tasks: JoinSet<()>,
    closing: CancellationToken,
    inputs: InputQueues,
}

impl Relay {
    async fn handle(&mut self, envelope: ClientEnvelope) {
        let correlation_id = envelope.correlation_id;
        match envelope.frame {
            ClientFrame::Ping => self.reply(correlation_id, ServerFrame::Pong).await,
            ClientFrame::Execute(request) => {
                let backend = Arc::clone(&self.backend);
                let tx = self.tx.clone();
                self.tasks.spawn(async move {
                    let frame = match backend.execute(request).await {
                        Ok(result) => ServerFrame::Result(result),
                        Err(e) => error_frame(&e, None),
                    };
                    let _ = tx.send(ServerEnvelope::correlated(frame, correlation_id)).await;
                });
            }
            ClientFrame::Open { language, source } => {
                let manager = Arc::clone(&self.manager);
                let tx = self.tx.clone();
                let closing = self.closing.clone();
                let inputs = Arc::clone(&self.inputs);
                self.tasks.spawn(async move {
                    let opening = Opening {
                        language: &language,
                        source: &source,
                        correlation_id,
                    };
                    open_session(&manager, &tx, &inputs, opening, &closing).await
                });
            }
            ClientFrame::Input { session_id, text } => {
                self.queue_input(session_id, InputCommand::Line(text), correlation_id)
                    .await
            }
            ClientFrame::Eof { session_id } => {
                self.queue_input(session_id, InputCommand::Eof, correlation_id)
                    .await
            }
            ClientFrame::Close { session_id } => {
                let manager = Arc::clone(&self.manager);
                let tx = self.tx.clone();
                self.tasks.spawn(async move {
                    if let Err(e) = manager.close(session_id).await {
                        let frame = error_frame(&e, Some(session_id));
                        let _ = tx.send(ServerEnvelope::correlated(frame, correlation_id)).await;
                    }
                });
            }
        }
    }

    /// Hand input to the session's writer without waiting on its pipe
    async fn queue_input(
        &mut self,
        session_id: SessionId,
        command: InputCommand,
        correlation_id: Option<Uuid>,
    ) {
        let queued = QueuedInput {
            command,
            correlation_id,
        };
        let queue = queues(&self.inputs).get(&session_id).cloned();
        let queued = match queue {
            Some(queue) => match queue.try_send(queued) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    let err = SandboxError::ResourceExhausted(format!(
                        "input queue for session {} is full",
                        session_id
                    ));
                    self.reply(correlation_id, error_frame(&err, Some(session_id)))
                        .await;
                    return;
                }
                Err(TrySendError::Closed(queued)) => queued,
            },
            None => queued,
        };

        // No live writer: the manager reports why, off the frame loop
        let manager = Arc::clone(&self.manager);
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            if let Err(e) = apply_input(&manager, session_id, queued.command).await {
                let frame = error_frame(&e, Some(session_id));
                let _ = tx
                    .send(ServerEnvelope::correlated(frame, queued.correlation_id))
                    .await;
            }
        });
    }

    async fn reply(&self, correlation_id: Option<Uuid>, frame: ServerFrame) {
        let _ = self
            .tx
            .send(ServerEnvelope::correlated(frame, correlation_id))
            .await;
    }
}

struct Opening<'a> {
    language: &'a str,
    source: &'a str,
    correlation_id: Option<Uuid>,
}

/// Open a session, announce it, then forward its events until the
/// terminal one while feeding it queued input.
async fn open_session(
    manager: &SessionManager,
    tx: &Outbound,
    inputs: &InputQueues,
    opening: Opening<'_>,
    closing: &CancellationToken,
) {
    let correlation_id = opening.correlation_id;
    let opened = manager
        .open(opening.language, opening.source)
        .await
        .and_then(|id| Ok((id, manager.receive_output(id)?)));
    let (session_id, mut events) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = tx
                .send(ServerEnvelope::correlated(error_frame(&e, None), correlation_id))
                .await;
            return;
        }
    };

    if closing.is_cancelled() {
        let _ = manager.close(session_id).await;
    }

    let (queue, pending) = mpsc::channel(INPUT_QUEUE);
    queues(inputs).insert(session_id, queue);

    let forward = async {
        let state = manager.state(session_id).unwrap_or(SessionState::Running);
        let announced = ServerFrame::Opened { session_id, state };
        if tx
            .send(ServerEnvelope::correlated(announced, correlation_id))
            .await
            .is_ok()
        {
            while let Some(event) = events.next().await {
                let frame = ServerFrame::Event { session_id, event };
                if tx
                    .send(ServerEnvelope::correlated(frame, correlation_id))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        debug!(session_id = %session_id, "Event stream ended");
        // Dropping the last sender lets the writer drain and stop
        queues(inputs).remove(&session_id);
    };
    tokio::join!(forward, feed_input(manager, tx, session_id, pending));
}

/// Write queued input to one session in arrival order
async fn feed_input(
    manager: &SessionManager,
    tx: &Outbound,
    session_id: SessionId,
    mut pending: mpsc::Receiver<QueuedInput>,
) {
    while let Some(queued) = pending.recv().await {
        if let Err(e) = apply_input(manager, session_id, queued.command).await {
            let frame = error_frame(&e, Some(session_id));
            let _ = tx
                .send(ServerEnvelope::correlated(frame, queued.correlation_id))
                .await;
        }
    }
}

async fn apply_input(
    manager: &SessionManager,
    session_id: SessionId,
    command: InputCommand,
) -> Result<(), SandboxError> {
    match command {
        InputCommand::Line(text) => manager.send_input(session_id, &text).await,
        InputCommand::Eof => manager.close_input(session_id).await,
    }
}

fn error_frame(err: &SandboxError, session_id: Option<SessionId>) -> ServerFrame {
    if !err.is_caller_error() {
        warn!("Relay request failed: {}", err);
    }
    ServerFrame::Error {
        message: err.public_message(),
        session_id,
    }
}

async fn write_frames<W>(output: W, mut rx: mpsc::Receiver<ServerEnvelope>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(output);
    while let Some(envelope) = rx.recv().await {
        let mut line = serde_json::to_vec(&envelope).context("Failed to encode frame")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("Failed to write relay output")?;
        writer.flush().await.context("Failed to flush relay output")?;
    }
    Ok(())
}
