//! Sandbox trait and containment tiers

mod child;
mod container;
mod process;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub use child::{exit_code_of, SandboxedChild};
pub use container::ContainerSandbox;
pub use process::ProcessSandbox;

/// Containment level, ordered from weakest to strongest.
///
/// Only [`SandboxTier::Container`] is meant for adversarial input. The
/// process tiers bound resource use and clean up after themselves but
/// share the host filesystem with the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxTier {
    /// Unprivileged child, wall-clock deadline and group kill only
    Process,
    /// Adds rlimits and an optional private network namespace
    #[default]
    Restricted,
    /// Container runtime with no network and only the workspace mounted
    Container,
}

impl SandboxTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxTier::Process => "process",
            SandboxTier::Restricted => "restricted",
            SandboxTier::Container => "container",
        }
    }
}

impl fmt::Display for SandboxTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compile or run step to be started inside a sandbox
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub argv: &'a [String],
    /// Workspace directory; the step's current directory
    pub workdir: &'a Path,
    pub limits: &'a ResourceLimits,
    /// Apply the address-space rlimit (see `LanguageSpec::enforce_address_space`)
    pub enforce_address_space: bool,
    /// Wall-clock budget; the sandbox only uses it to size CPU limits
    pub deadline: Duration,
}

impl Invocation<'_> {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

/// Starts processes with some level of containment.
///
/// Implementations only spawn; deadlines, output capture and teardown are
/// driven by the caller through the returned [`SandboxedChild`].
pub trait Sandbox: Send + Sync {
    fn tier(&self) -> SandboxTier;

    /// Get sandbox name
    fn name(&self) -> &str;

    /// Called once per workspace before the first step
    fn prepare_workspace(&self, _workdir: &Path) -> Result<()> {
        Ok(())
    }

    /// Start the step with stdin, stdout and stderr piped
    fn spawn(&self, invocation: &Invocation<'_>) -> Result<SandboxedChild>;
}

/// Build the sandbox selected by configuration
pub fn build_sandbox(config: &SandboxConfig) -> Arc<dyn Sandbox> {
    match config.tier {
        SandboxTier::Process => Arc::new(ProcessSandbox::unrestricted(config.path.clone())),
        SandboxTier::Restricted => Arc::new(ProcessSandbox::restricted(
            config.path.clone(),
            config.isolate_network,
        )),
        SandboxTier::Container => Arc::new(ContainerSandbox::new(config.container.clone())),
    }
}

/// Command with a scrubbed environment, piped stdio and its own process
/// group, so the whole tree can be signalled at once.
pub(crate) fn base_command(program: &str, args: &[String], workdir: &Path, path: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .env_clear()
        .env("PATH", path)
        .env("HOME", workdir)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

pub(crate) fn spawn_error(program: &str, source: std::io::Error) -> SandboxError {
    SandboxError::Spawn {
        program: program.to_string(),
        source,
    }
}
