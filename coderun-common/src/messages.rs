//! Line-delimited JSON frames spoken by duplex transports (stdio relay,
//! socket gateways) on top of the engine contract.

use crate::{ExecutionRequest, ExecutionResult, SessionEvent, SessionId, SessionState};
use serde::{Deserialize, Serialize};

/// Transport -> engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// One-shot batch execution
    Execute(ExecutionRequest),
    /// Start an interactive session
    Open { language: String, source: String },
    /// Append a line to the session's stdin
    Input { session_id: SessionId, text: String },
    /// Close the session's stdin
    Eof { session_id: SessionId },
    /// Terminate the session
    Close { session_id: SessionId },
    Ping,
}

/// Engine -> transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Result(ExecutionResult),
    Opened {
        session_id: SessionId,
        state: SessionState,
    },
    Event {
        session_id: SessionId,
        event: SessionEvent,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Pong,
}

/// Frame wrapper carrying correlation and timing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<F> {
    #[serde(flatten)]
    pub frame: F,
    /// Echoed from the client frame that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<uuid::Uuid>,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<F> Envelope<F> {
    pub fn new(frame: F) -> Self {
        Self {
            frame,
            correlation_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn correlated(frame: F, correlation_id: Option<uuid::Uuid>) -> Self {
        Self {
            frame,
            correlation_id,
            timestamp: chrono::Utc::now(),
        }
    }
}

pub type ClientEnvelope = Envelope<ClientFrame>;
pub type ServerEnvelope = Envelope<ServerFrame>;
