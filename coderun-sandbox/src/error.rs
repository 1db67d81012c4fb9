use coderun_common::{SessionId, SessionState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Engine-level failures.
///
/// Compile errors, non-zero exits and timeouts are not errors; they are
/// reported as data in [`coderun_common::ExecutionResult`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Session {id} is {state}; cannot {operation}")]
    InvalidSessionState {
        id: SessionId,
        state: SessionState,
        operation: &'static str,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Remote backend error: {0}")]
    Remote(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Errors caused by the caller rather than the engine or host
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SandboxError::UnsupportedLanguage(_)
                | SandboxError::InvalidSessionState { .. }
                | SandboxError::SessionNotFound(_)
        )
    }

    /// Message safe to hand back across a trust boundary
    pub fn public_message(&self) -> String {
        match self {
            SandboxError::Internal(_) | SandboxError::Spawn { .. } => {
                "internal error while executing program".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Remote(err.to_string())
    }
}
