//! coderun sandbox - compile and run untrusted programs
//!
//! Provides the batch [`ExecutionPipeline`], the interactive
//! [`SessionManager`] and the containment tiers both run on. Programs are
//! written into a throwaway [`Workspace`], optionally compiled, then run
//! under a wall-clock deadline with their whole process group killed
//! afterwards.

mod backend;
mod config;
mod error;
mod execution;
mod limits;
mod pipeline;
mod registry;
mod sandbox;
mod session;
mod workspace;

pub use backend::{build_backend, ExecutionBackend, RemoteBackend};
pub use config::{
    BackendConfig, BackendKind, ContainerConfig, EngineConfig, EngineSection, RemoteConfig,
    SandboxConfig, SessionConfig, ToolchainOverride,
};
pub use error::{Result, SandboxError};
pub use execution::{run_step, StepOutput, StepStatus};
pub use limits::ResourceLimits;
pub use pipeline::{CompileOutcome, ExecutionPipeline};
pub use registry::{CommandTemplate, Language, LanguageSpec, TemplateContext, ToolchainRegistry};
pub use sandbox::{
    build_sandbox, exit_code_of, ContainerSandbox, Invocation, ProcessSandbox, Sandbox,
    SandboxTier, SandboxedChild,
};
pub use session::{SessionInfo, SessionManager};
pub use workspace::Workspace;

/// Re-export wire types
pub use coderun_common::{
    CloseReason, ExecutionRequest, ExecutionResult, Outcome, SessionEvent, SessionId,
    SessionState, StreamKind,
};
