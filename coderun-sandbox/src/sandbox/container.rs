//! Container sandbox (tier 3)

use super::child::ContainerHandle;
use super::{base_command, spawn_error, Invocation, Sandbox, SandboxTier, SandboxedChild};
use crate::config::ContainerConfig;
use crate::error::{Result, SandboxError};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const CONTAINER_WORKDIR: &str = "/workspace";
const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs every step in a throwaway container from a pre-built toolchain
/// image. The container has no network, no capabilities and sees only
/// the workspace, mounted read/write at `/workspace`.
pub struct ContainerSandbox {
    config: ContainerConfig,
}

impl ContainerSandbox {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Full argv for the container CLI
    fn docker_args(&self, invocation: &Invocation<'_>, name: &str) -> Vec<String> {
        let limits = invocation.limits;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--user".to_string(),
            self.config.user.clone(),
            "--cpus".to_string(),
            self.config.cpus.to_string(),
        ];

        if let Some(runtime) = &self.config.runtime {
            args.push(format!("--runtime={}", runtime));
        }
        if let Some(bytes) = limits.memory_bytes {
            args.push(format!("--memory={}", bytes));
            // Equal swap ceiling disables swap
            args.push(format!("--memory-swap={}", bytes));
        }
        if let Some(count) = limits.max_processes {
            args.push(format!("--pids-limit={}", count));
        }
        if let Some(count) = limits.max_open_files {
            args.push(format!("--ulimit=nofile={}:{}", count, count));
        }
        if let Some(bytes) = limits.max_file_size_bytes {
            args.push(format!("--ulimit=fsize={}:{}", bytes, bytes));
        }
        let cpu = limits.cpu_seconds_for(invocation.deadline);
        args.push(format!("--ulimit=cpu={}:{}", cpu, cpu.saturating_add(1)));
        args.push("--ulimit=core=0:0".to_string());

        args.push("-e".to_string());
        args.push(format!("PATH={}", CONTAINER_PATH));
        args.push("-e".to_string());
        args.push(format!("HOME={}", CONTAINER_WORKDIR));
        args.push("-v".to_string());
        args.push(format!("{}:{}", invocation.workdir.display(), CONTAINER_WORKDIR));
        args.push("-w".to_string());
        args.push(CONTAINER_WORKDIR.to_string());
        args.push(self.config.image.clone());
        args.extend(invocation.argv.iter().cloned());
        args
    }
}

impl Sandbox for ContainerSandbox {
    fn tier(&self) -> SandboxTier {
        SandboxTier::Container
    }

    fn name(&self) -> &str {
        "container"
    }

    /// The container user is not the workspace owner; open the directory up
    /// so compilers can write artifacts next to the source.
    fn prepare_workspace(&self, workdir: &Path) -> Result<()> {
        std::fs::set_permissions(workdir, std::fs::Permissions::from_mode(0o777)).map_err(|e| {
            SandboxError::Internal(format!(
                "Failed to open workspace {} to the container user: {}",
                workdir.display(),
                e
            ))
        })
    }

    fn spawn(&self, invocation: &Invocation<'_>) -> Result<SandboxedChild> {
        let name = format!("coderun-{}", uuid::Uuid::new_v4());
        let args = self.docker_args(invocation, &name);
        let host_path = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
        let mut cmd = base_command(&self.config.binary, &args, invocation.workdir, &host_path);
        // The CLI talks to the daemon through these when set
        for key in ["DOCKER_HOST", "DOCKER_CONFIG", "XDG_RUNTIME_DIR"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(&self.config.binary, e))?;
        tracing::debug!(
            container = %name,
            image = %self.config.image,
            program = invocation.program(),
            "Started container"
        );
        Ok(SandboxedChild::new(child, invocation.program()).with_container(ContainerHandle {
            binary: self.config.binary.clone(),
            name,
        }))
    }
}
