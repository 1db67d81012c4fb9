//! Batch execution: source in, bounded result out

use crate::config::EngineConfig;
use crate::error::{Result, SandboxError};
use crate::execution::{run_step, StepStatus};
use crate::limits::ResourceLimits;
use crate::registry::{LanguageSpec, TemplateContext, ToolchainRegistry};
use crate::sandbox::{build_sandbox, Invocation, Sandbox};
use crate::workspace::Workspace;
use coderun_common::{ExecutionRequest, ExecutionResult};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of the optional compile step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Language has no compile command
    Skipped,
    Succeeded,
    /// Toolchain exited non-zero; `output` is its diagnostics
    Failed { output: String, exit_code: i32 },
    TimedOut,
    Cancelled,
}

/// Write source, compile if needed, run, collect, tear down.
///
/// Each call owns its workspace and process tree exclusively; calls may
/// run concurrently. Only the registry and configuration are shared.
pub struct ExecutionPipeline {
    registry: Arc<ToolchainRegistry>,
    sandbox: Arc<dyn Sandbox>,
    config: Arc<EngineConfig>,
}

impl ExecutionPipeline {
    /// Build the registry and sandbox described by `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = ToolchainRegistry::with_overrides(&config.toolchains)?;
        let sandbox = build_sandbox(&config.sandbox);
        tracing::info!(
            sandbox = sandbox.name(),
            workspace_root = %config.engine.workspace_root().display(),
            "Execution pipeline ready"
        );
        Ok(Self::with_parts(Arc::new(registry), sandbox, Arc::new(config)))
    }

    pub fn with_parts(
        registry: Arc<ToolchainRegistry>,
        sandbox: Arc<dyn Sandbox>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            sandbox,
            config,
        }
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    /// Execute one request.
    ///
    /// Compile failures, non-zero exits and timeouts come back as data in
    /// the result. Dropping the returned future kills the process group
    /// and removes the workspace.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_cancellable(request, CancellationToken::new())
            .await
    }

    /// Like [`Self::execute`], aborting with [`SandboxError::Cancelled`]
    /// once `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let spec = self.registry.resolve(&request.language)?;
        let run_timeout = self.config.engine.clamp_run_timeout(request.timeout_secs);
        let limits = self
            .config
            .sandbox
            .run_limits
            .clone()
            .with_memory_cap(request.memory_limit_bytes);

        tracing::info!(
            language = %spec.language,
            source_len = request.source.len(),
            stdin_len = request.stdin.len(),
            timeout_secs = run_timeout.as_secs(),
            "Executing program"
        );

        let workspace = self.prepare(&spec, &request.source)?;

        match self.compile(&spec, &workspace, &cancel).await? {
            CompileOutcome::Skipped | CompileOutcome::Succeeded => {}
            CompileOutcome::Failed { output, exit_code } => {
                tracing::info!(language = %spec.language, exit_code, "Compilation failed");
                return Ok(ExecutionResult::compile_failed(output, exit_code)
                    .with_duration_ms(elapsed_ms(started)));
            }
            CompileOutcome::TimedOut => {
                tracing::info!(language = %spec.language, "Compilation timed out");
                return Ok(ExecutionResult::compile_timed_out().with_duration_ms(elapsed_ms(started)));
            }
            CompileOutcome::Cancelled => return Err(SandboxError::Cancelled),
        }

        let argv = spec.run.render(&TemplateContext {
            memory_mb: limits.memory_mb(),
        });
        let invocation = Invocation {
            argv: &argv,
            workdir: workspace.path(),
            limits: &limits,
            enforce_address_space: spec.enforce_address_space,
            deadline: run_timeout,
        };
        let step = run_step(
            self.sandbox(),
            &invocation,
            Some(&request.stdin),
            self.config.engine.max_output_bytes,
            &cancel,
        )
        .await?;
        workspace.destroy();

        let result = match step.status {
            StepStatus::Exited(code) => ExecutionResult::completed(step.stdout, step.stderr, code),
            StepStatus::TimedOut => ExecutionResult::timed_out(step.stdout, step.stderr),
            StepStatus::Cancelled => return Err(SandboxError::Cancelled),
        }
        .with_truncated(step.truncated)
        .with_duration_ms(elapsed_ms(started));

        tracing::info!(
            language = %spec.language,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "Execution finished"
        );
        Ok(result)
    }

    /// Fresh workspace holding the source under its fixed name
    pub(crate) fn prepare(&self, spec: &LanguageSpec, source: &str) -> Result<Workspace> {
        let workspace = Workspace::create(&self.config.engine.workspace_root())?;
        self.sandbox.prepare_workspace(workspace.path())?;
        workspace.write_source(&spec.source_file, source)?;
        Ok(workspace)
    }

    /// Run the compile command, if any, under the compile deadline
    pub(crate) async fn compile(
        &self,
        spec: &LanguageSpec,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome> {
        let Some(template) = &spec.compile else {
            return Ok(CompileOutcome::Skipped);
        };

        let limits: &ResourceLimits = &self.config.sandbox.compile_limits;
        let argv = template.render(&TemplateContext {
            memory_mb: limits.memory_mb(),
        });
        let invocation = Invocation {
            argv: &argv,
            workdir: workspace.path(),
            limits,
            enforce_address_space: spec.enforce_address_space,
            deadline: self.config.engine.compile_timeout,
        };
        tracing::debug!(language = %spec.language, compiler = invocation.program(), "Compiling");

        let step = run_step(
            self.sandbox(),
            &invocation,
            None,
            self.config.engine.max_output_bytes,
            cancel,
        )
        .await?;

        Ok(match step.status {
            StepStatus::Exited(0) => CompileOutcome::Succeeded,
            StepStatus::Exited(exit_code) => CompileOutcome::Failed {
                output: if step.stderr.trim().is_empty() {
                    step.stdout
                } else {
                    step.stderr
                },
                exit_code,
            },
            StepStatus::TimedOut => CompileOutcome::TimedOut,
            StepStatus::Cancelled => CompileOutcome::Cancelled,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
