//! Shared helpers for the integration and end-to-end suites

use coderun_common::SessionEvent;
use coderun_sandbox::{EngineConfig, ExecutionPipeline, SandboxTier, ToolchainOverride};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};

/// PATH handed to sandboxed programs in tests
pub const TEST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("coderun_sandbox=debug")
        .with_test_writer()
        .try_init();
}

/// Whether `program` is installed somewhere on [`TEST_PATH`]
pub fn toolchain_available(program: &str) -> bool {
    TEST_PATH
        .split(':')
        .any(|dir| Path::new(dir).join(program).is_file())
}

/// Skip the calling test when a toolchain is missing
#[macro_export]
macro_rules! require_toolchain {
    ($program:expr) => {
        if !$crate::toolchain_available($program) {
            eprintln!("skipping: {} not installed", $program);
            return;
        }
    };
}

/// Live (non-zombie) process with this pid exists
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Field 3 is the state; `Z` is a zombie waiting for its reaper
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Restricted-tier config rooted at `workspace_root`.
///
/// Network isolation and the per-uid process cap are off so the suite
/// runs on hosts without user namespaces and under busy CI users.
pub fn test_config(workspace_root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.workspace_root = Some(workspace_root.to_path_buf());
    config.sandbox.tier = SandboxTier::Restricted;
    config.sandbox.isolate_network = false;
    config.sandbox.path = TEST_PATH.to_string();
    config.sandbox.run_limits.max_processes = None;
    config.sandbox.compile_limits.max_processes = None;
    config
}

/// Shell programs get a syntax-check compile step so compile failures
/// can be exercised without a C toolchain.
pub fn with_shell_syntax_check(mut config: EngineConfig) -> EngineConfig {
    config.toolchains.insert(
        "shell".to_string(),
        ToolchainOverride {
            compile: Some(vec!["sh".into(), "-n".into(), "main.sh".into()]),
            ..ToolchainOverride::default()
        },
    );
    config
}

pub fn test_pipeline(config: EngineConfig) -> Arc<ExecutionPipeline> {
    setup_test_logging();
    Arc::new(ExecutionPipeline::new(config).expect("Failed to build pipeline"))
}

/// Entries left under a workspace root
pub fn workspace_entries(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}

/// Session output gathered until the terminal event
#[derive(Debug, Default)]
pub struct Transcript {
    pub stdout: String,
    pub stderr: String,
    pub terminal: Option<SessionEvent>,
}

/// Drain a session stream, giving up after `limit`
pub async fn collect_events<S>(mut events: S, limit: Duration) -> Transcript
where
    S: Stream<Item = SessionEvent> + Unpin,
{
    let mut transcript = Transcript::default();
    let collected = tokio::time::timeout(limit, async {
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::Output { stream, data } => match stream {
                    coderun_common::StreamKind::Stdout => transcript.stdout.push_str(&data),
                    coderun_common::StreamKind::Stderr => transcript.stderr.push_str(&data),
                },
                terminal => {
                    transcript.terminal = Some(terminal);
                    break;
                }
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "session did not finish within {:?}", limit);
    transcript
}

/// Poll until `condition` holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
