//! Request, result and session types shared by the engine and transports

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Run timeout applied when a request does not carry one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Exit code reported when no real process exit code exists
/// (timeouts, internal errors).
pub const SENTINEL_EXIT_CODE: i32 = -1;

/// Request to compile (if needed) and run one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Language identifier, e.g. `python`, `cpp`, `java`
    pub language: String,

    /// Program source text, written verbatim
    #[serde(alias = "code")]
    pub source: String,

    /// Full stdin fed to the program up front
    #[serde(default)]
    pub stdin: String,

    /// Requested run timeout in seconds; clamped by the engine
    #[serde(rename = "timeout", alias = "timeout_secs", default = "default_timeout")]
    pub timeout_secs: u64,

    /// Optional memory ceiling; can only tighten the configured limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            memory_limit_bytes: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }
}

/// Which of the mutually exclusive outcomes a result describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The program ran and exited on its own (any exit code)
    Completed,
    /// The run step exceeded its deadline and was killed
    TimedOut,
    /// The compile step failed or exceeded its deadline
    CompileFailed,
    /// The engine could not produce a program-level result
    InternalError,
}

/// Result of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Toolchain diagnostics; empty unless the compile step failed
    pub compile_output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub outcome: Outcome,
    /// Set when either output stream hit the capture ceiling
    #[serde(default)]
    pub truncated: bool,
    /// Wall-clock duration of the whole execution
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Program exited by itself
    pub fn completed(stdout: String, stderr: String, exit_code: i32) -> Self {
        Self {
            stdout,
            stderr,
            compile_output: String::new(),
            exit_code,
            timed_out: false,
            outcome: Outcome::Completed,
            truncated: false,
            duration_ms: 0,
        }
    }

    /// Run step killed at its deadline; keeps whatever output was buffered
    pub fn timed_out(stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr,
            compile_output: String::new(),
            exit_code: SENTINEL_EXIT_CODE,
            timed_out: true,
            outcome: Outcome::TimedOut,
            truncated: false,
            duration_ms: 0,
        }
    }

    /// Toolchain rejected the program. Never carries run output.
    pub fn compile_failed(compile_output: String, exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            compile_output,
            exit_code,
            timed_out: false,
            outcome: Outcome::CompileFailed,
            truncated: false,
            duration_ms: 0,
        }
    }

    pub fn compile_timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            compile_output: "Compilation timed out".to_string(),
            exit_code: SENTINEL_EXIT_CODE,
            timed_out: true,
            outcome: Outcome::CompileFailed,
            truncated: false,
            duration_ms: 0,
        }
    }

    /// Generic failure returned to callers when the engine itself faulted.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            compile_output: String::new(),
            exit_code: SENTINEL_EXIT_CODE,
            timed_out: false,
            outcome: Outcome::InternalError,
            truncated: false,
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// Program ran to completion with exit code 0
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_code == 0
    }

    /// Equality ignoring wall-clock fields
    pub fn same_observable_output(&self, other: &Self) -> bool {
        self.stdout == other.stdout
            && self.stderr == other.stderr
            && self.compile_output == other.compile_output
            && self.exit_code == other.exit_code
            && self.timed_out == other.timed_out
            && self.outcome == other.outcome
            && self.truncated == other.truncated
    }
}

/// Opaque interactive session token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Interactive session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Compiling,
    Running,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Legal edges of the session state machine.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Starting, Compiling) | (Starting, Running) | (Compiling, Running) => true,
            (Running, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            // Teardown before the program ever started still counts as a close.
            (Starting, Closed) | (Compiling, Closed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which program stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Why a session ended without the program exiting on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Caller asked for `close`
    Requested,
    /// No input and no output for longer than the idle timeout
    IdleTimeout,
    /// Session outlived the configured maximum lifetime
    LifetimeExceeded,
    /// Manager shut down or the transport disconnected
    Shutdown,
}

/// Incremental events produced by an interactive session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Bytes the program wrote, in the order it wrote them
    Output { stream: StreamKind, data: String },
    /// Compile step rejected the program; the session is `Failed`
    CompileFailed { output: String, timed_out: bool },
    /// Program exited on its own; the session is `Closed`
    Exited { exit_code: i32 },
    /// Session was terminated; the session is `Closed`
    Closed { reason: CloseReason },
}

impl SessionEvent {
    /// Last event a session stream yields
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Output { .. })
    }
}
