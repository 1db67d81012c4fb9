//! Engine configuration
//!
//! Loaded from TOML; every section and field has a default so an empty file
//! (or no file at all) yields a working local engine.

use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use crate::sandbox::SandboxTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Per-language command overrides, keyed by language id
    #[serde(default)]
    pub toolchains: HashMap<String, ToolchainOverride>,
}

/// Batch pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Parent directory for workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,
    /// Deadline for compile steps; not caller-controlled
    #[serde(with = "humantime_serde")]
    pub compile_timeout: Duration,
    pub min_run_timeout_secs: u64,
    pub max_run_timeout_secs: u64,
    /// Capture ceiling per output stream
    pub max_output_bytes: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            compile_timeout: Duration::from_secs(10),
            min_run_timeout_secs: 1,
            max_run_timeout_secs: 30,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl EngineSection {
    /// Clamp a caller-supplied run timeout into the configured range.
    pub fn clamp_run_timeout(&self, requested_secs: u64) -> Duration {
        Duration::from_secs(requested_secs.clamp(self.min_run_timeout_secs, self.max_run_timeout_secs))
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Containment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub tier: SandboxTier,
    /// Run restricted-tier children in a private network namespace
    pub isolate_network: bool,
    /// `PATH` given to sandboxed programs
    pub path: String,
    pub run_limits: ResourceLimits,
    pub compile_limits: ResourceLimits,
    pub container: ContainerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tier: SandboxTier::Restricted,
            isolate_network: true,
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            run_limits: ResourceLimits::default(),
            compile_limits: ResourceLimits::compile_default(),
            container: ContainerConfig::default(),
        }
    }
}

/// Container tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI (`docker`, `podman`)
    pub binary: String,
    /// Image holding every configured toolchain
    pub image: String,
    /// OCI runtime override, e.g. `runsc` for gVisor
    pub runtime: Option<String>,
    pub cpus: f32,
    /// `uid:gid` the program runs as inside the container
    pub user: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "coderun/toolchains:latest".to_string(),
            runtime: None,
            cpus: 1.0,
            user: "65534:65534".to_string(),
        }
    }
}

/// Interactive session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close a session after this long without input or output
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Hard cap on session lifetime
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    /// How long terminal sessions stay inspectable before eviction
    #[serde(with = "humantime_serde")]
    pub closed_retention: Duration,
    /// Events buffered before the program is back-pressured
    pub output_buffer: usize,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(600),
            closed_retention: Duration::from_secs(30),
            output_buffer: 256,
            max_sessions: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

/// Which backend serves batch executions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub remote: Option<RemoteConfig>,
}

/// Piston-compatible remote execution API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "RemoteConfig::default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl RemoteConfig {
    fn default_request_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// Replacement commands for one language. An empty `compile` list removes
/// the compile step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainOverride {
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    #[serde(default)]
    pub run: Option<Vec<String>>,
    #[serde(default)]
    pub enforce_address_space: Option<bool>,
}

impl EngineConfig {
    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SandboxError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.min_run_timeout_secs == 0 {
            return Err(SandboxError::Config(
                "engine.min_run_timeout_secs must be at least 1".to_string(),
            ));
        }
        if engine.min_run_timeout_secs > engine.max_run_timeout_secs {
            return Err(SandboxError::Config(format!(
                "engine.min_run_timeout_secs ({}) exceeds engine.max_run_timeout_secs ({})",
                engine.min_run_timeout_secs, engine.max_run_timeout_secs
            )));
        }
        if engine.compile_timeout.is_zero() {
            return Err(SandboxError::Config(
                "engine.compile_timeout must be positive".to_string(),
            ));
        }
        if self.sessions.output_buffer == 0 {
            return Err(SandboxError::Config(
                "sessions.output_buffer must be at least 1".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Remote && self.backend.remote.is_none() {
            return Err(SandboxError::Config(
                "backend.kind = \"remote\" requires a [backend.remote] section".to_string(),
            ));
        }
        Ok(())
    }
}
