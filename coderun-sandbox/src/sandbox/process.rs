//! Process-based sandboxes (tiers 1 and 2)

use super::{base_command, spawn_error, Invocation, Sandbox, SandboxTier, SandboxedChild};
use crate::error::Result;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};

/// rlimit values resolved before fork; `pre_exec` must not allocate.
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    address_space: Option<u64>,
    cpu_secs: u64,
    processes: Option<u64>,
    open_files: Option<u64>,
    file_size: Option<u64>,
    isolate_network: bool,
}

impl RlimitPlan {
    fn from_invocation(invocation: &Invocation<'_>, isolate_network: bool) -> Self {
        let limits = invocation.limits;
        Self {
            address_space: limits
                .memory_bytes
                .filter(|_| invocation.enforce_address_space),
            cpu_secs: limits.cpu_seconds_for(invocation.deadline),
            processes: limits.max_processes,
            open_files: limits.max_open_files,
            file_size: limits.max_file_size_bytes,
            isolate_network,
        }
    }

    /// Runs in the forked child between fork and exec.
    fn apply(&self) -> std::io::Result<()> {
        if self.isolate_network {
            // A fresh user namespace lets an unprivileged caller own the
            // new (empty) network namespace.
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
        }
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        // Hard limit one second above soft: SIGXCPU first, then SIGKILL.
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs.saturating_add(1))?;
        if let Some(count) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, count, count)?;
        }
        if let Some(count) = self.open_files {
            setrlimit(Resource::RLIMIT_NOFILE, count, count)?;
        }
        if let Some(bytes) = self.file_size {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// Runs steps as plain child processes of the engine.
///
/// Without restrictions this is tier 1: the deadline and group kill are
/// the only containment, which is not enough against hostile code. With
/// restrictions (tier 2) every step also gets rlimits and, optionally, a
/// private network namespace with no interfaces but loopback.
pub struct ProcessSandbox {
    path: String,
    restricted: bool,
    isolate_network: bool,
}

impl ProcessSandbox {
    pub fn unrestricted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            restricted: false,
            isolate_network: false,
        }
    }

    /// Network isolation needs unprivileged user namespaces
    /// (`kernel.unprivileged_userns_clone`); spawning fails without them.
    pub fn restricted(path: impl Into<String>, isolate_network: bool) -> Self {
        Self {
            path: path.into(),
            restricted: true,
            isolate_network,
        }
    }
}

impl Sandbox for ProcessSandbox {
    fn tier(&self) -> SandboxTier {
        if self.restricted {
            SandboxTier::Restricted
        } else {
            SandboxTier::Process
        }
    }

    fn name(&self) -> &str {
        if self.restricted {
            "restricted"
        } else {
            "process"
        }
    }

    fn spawn(&self, invocation: &Invocation<'_>) -> Result<SandboxedChild> {
        let program = invocation.program();
        let args = invocation.argv.get(1..).unwrap_or_default();
        let mut cmd = base_command(program, args, invocation.workdir, &self.path);

        if self.restricted {
            let plan = RlimitPlan::from_invocation(invocation, self.isolate_network);
            // SAFETY: `apply` only issues async-signal-safe syscalls
            // (unshare, setrlimit) on values copied before fork.
            unsafe {
                cmd.pre_exec(move || plan.apply());
            }
        }

        let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        let handle = SandboxedChild::new(child, program);
        tracing::debug!(
            sandbox = self.name(),
            program,
            pgid = ?handle.pgid(),
            "Spawned step"
        );
        Ok(handle)
    }
}
