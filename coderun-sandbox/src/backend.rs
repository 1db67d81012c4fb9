//! Interchangeable batch backends: the local pipeline or a remote judge

use crate::config::{BackendKind, EngineSection, RemoteConfig};
use crate::error::{Result, SandboxError};
use crate::pipeline::ExecutionPipeline;
use crate::registry::ToolchainRegistry;
use async_trait::async_trait;
use coderun_common::{ExecutionRequest, ExecutionResult, SENTINEL_EXIT_CODE};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Anything that turns a request into a result
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;

    /// Get backend name
    fn name(&self) -> &str;
}

#[async_trait]
impl ExecutionBackend for ExecutionPipeline {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        ExecutionPipeline::execute(self, request).await
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Pick the batch backend named by `backend.kind`
pub fn build_backend(pipeline: &Arc<ExecutionPipeline>) -> Result<Arc<dyn ExecutionBackend>> {
    let config = pipeline.config();
    match config.backend.kind {
        BackendKind::Local => Ok(Arc::clone(pipeline) as Arc<dyn ExecutionBackend>),
        BackendKind::Remote => {
            let remote = config.backend.remote.clone().ok_or_else(|| {
                SandboxError::Config("backend.kind = \"remote\" requires [backend.remote]".to_string())
            })?;
            let backend = RemoteBackend::new(
                remote,
                config.engine.clone(),
                Arc::new(pipeline.registry().clone()),
            )?;
            Ok(Arc::new(backend))
        }
    }
}

#[derive(Debug, Serialize)]
struct PistonFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PistonRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<PistonFile<'a>>,
    stdin: &'a str,
    compile_timeout: u64,
    run_timeout: u64,
    /// Bytes; -1 leaves the server default
    run_memory_limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PistonStage {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    signal: Option<String>,
    /// Short status such as `TO` (timeout), `RE`, `SG`
    #[serde(default)]
    status: Option<String>,
}

impl PistonStage {
    fn timed_out(&self) -> bool {
        self.status.as_deref() == Some("TO")
    }

    fn exit_code(&self) -> i32 {
        if let Some(code) = self.code {
            return code;
        }
        self.signal
            .as_deref()
            .and_then(|name| nix::sys::signal::Signal::from_str(name).ok())
            .map(|signal| 128 + signal as i32)
            .unwrap_or(SENTINEL_EXIT_CODE)
    }
}

#[derive(Debug, Deserialize)]
struct PistonResponse {
    #[serde(default)]
    compile: Option<PistonStage>,
    run: Option<PistonStage>,
}

#[derive(Debug, Deserialize)]
struct PistonError {
    message: String,
}

impl PistonResponse {
    fn into_result(self) -> Result<ExecutionResult> {
        if let Some(compile) = self.compile {
            if compile.timed_out() {
                return Ok(ExecutionResult::compile_timed_out());
            }
            let code = compile.exit_code();
            if code != 0 {
                let output = if compile.stderr.trim().is_empty() {
                    compile.output
                } else {
                    compile.stderr
                };
                return Ok(ExecutionResult::compile_failed(output, code));
            }
        }

        let run = self
            .run
            .ok_or_else(|| SandboxError::Remote("response has no run stage".to_string()))?;
        if run.timed_out() {
            return Ok(ExecutionResult::timed_out(run.stdout, run.stderr));
        }
        let exit_code = run.exit_code();
        Ok(ExecutionResult::completed(run.stdout, run.stderr, exit_code))
    }
}

/// Client for a Piston-compatible execution API (`POST /api/v2/execute`)
pub struct RemoteBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    engine: EngineSection,
    registry: Arc<ToolchainRegistry>,
}

impl RemoteBackend {
    pub fn new(
        remote: RemoteConfig,
        engine: EngineSection,
        registry: Arc<ToolchainRegistry>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(remote.request_timeout)
            .build()?;
        let endpoint = format!("{}/api/v2/execute", remote.url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            api_key: remote.api_key,
            engine,
            registry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let spec = self.registry.resolve(&request.language)?;
        let run_timeout = self.engine.clamp_run_timeout(request.timeout_secs);

        let body = PistonRequest {
            language: spec.language.remote_name(),
            version: "*",
            files: vec![PistonFile {
                name: &spec.source_file,
                content: &request.source,
            }],
            stdin: &request.stdin,
            compile_timeout: self.engine.compile_timeout.as_millis() as u64,
            run_timeout: run_timeout.as_millis() as u64,
            run_memory_limit: request
                .memory_limit_bytes
                .and_then(|bytes| i64::try_from(bytes).ok())
                .unwrap_or(-1),
        };

        tracing::info!(
            endpoint = %self.endpoint,
            language = %spec.language,
            source_len = request.source.len(),
            "Submitting to remote backend"
        );

        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", key);
        }
        let response = call.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<PistonError>().await {
                Ok(error) => error.message,
                Err(_) => format!("remote backend returned status {}", status),
            };
            return Err(SandboxError::Remote(message));
        }

        let parsed: PistonResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Remote(format!("Failed to parse response: {}", e)))?;
        let result = parsed
            .into_result()?
            .with_duration_ms(started.elapsed().as_millis() as u64);

        tracing::info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "Remote execution finished"
        );
        Ok(result)
    }

    fn name(&self) -> &str {
        "remote"
    }
}
