//! Resource ceilings applied to sandboxed compile and run steps

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Memory advertised to runtimes that take their heap size as a flag
/// when no memory ceiling is configured.
const FALLBACK_MEMORY_MB: u64 = 256;

/// Per-process resource limits.
///
/// Wall-clock time is not part of this struct: the deadline is owned by
/// the caller of a step and enforced by killing the process group.
///
/// In config files a ceiling may be written as `"unlimited"` to lift it;
/// leaving the key out keeps the preset value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space ceiling in bytes
    #[serde(with = "ceiling")]
    pub memory_bytes: Option<u64>,

    /// CPU seconds; when unset the step deadline plus one second is used
    pub cpu_time_secs: Option<u64>,

    /// Process/thread count (RLIMIT_NPROC, counted per uid by the kernel)
    #[serde(with = "ceiling")]
    pub max_processes: Option<u64>,

    /// Open file descriptors
    #[serde(with = "ceiling")]
    pub max_open_files: Option<u64>,

    /// Largest file the program may write
    #[serde(with = "ceiling")]
    pub max_file_size_bytes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(256 * MIB),
            cpu_time_secs: None,
            max_processes: Some(512),
            max_open_files: Some(128),
            max_file_size_bytes: Some(64 * MIB),
        }
    }
}

impl ResourceLimits {
    /// Compilers need more memory, processes and files than programs.
    pub fn compile_default() -> Self {
        Self {
            memory_bytes: Some(1024 * MIB),
            cpu_time_secs: None,
            max_processes: Some(1024),
            max_open_files: Some(512),
            max_file_size_bytes: Some(256 * MIB),
        }
    }

    /// Create unlimited resource configuration (dangerous!)
    pub fn unlimited() -> Self {
        Self {
            memory_bytes: None,
            cpu_time_secs: None,
            max_processes: None,
            max_open_files: None,
            max_file_size_bytes: None,
        }
    }

    /// Tighten the memory ceiling with a caller-requested value.
    /// A request can never raise the configured limit.
    pub fn with_memory_cap(mut self, requested: Option<u64>) -> Self {
        self.memory_bytes = match (self.memory_bytes, requested) {
            (Some(configured), Some(requested)) => Some(configured.min(requested)),
            (None, Some(requested)) => Some(requested),
            (configured, None) => configured,
        };
        self
    }

    /// Memory in MiB for runtimes configured through flags (`-Xmx`, ...)
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes
            .map(|bytes| (bytes / MIB).max(16))
            .unwrap_or(FALLBACK_MEMORY_MB)
    }

    /// CPU-time ceiling for a step bounded by `deadline`
    pub fn cpu_seconds_for(&self, deadline: Duration) -> u64 {
        self.cpu_time_secs
            .unwrap_or_else(|| deadline.as_secs().saturating_add(1))
    }
}

/// `Option<u64>` ceiling where `None` is spelled `"unlimited"`, so a
/// lifted limit survives the struct-level defaults.
mod ceiling {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    const UNLIMITED: &str = "unlimited";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Written {
        Value(u64),
        Word(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_u64(*value),
            None => serializer.serialize_str(UNLIMITED),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Written::deserialize(deserializer)? {
            Written::Value(value) => Ok(Some(value)),
            Written::Word(word) if word == UNLIMITED || word == "none" => Ok(None),
            Written::Word(word) => Err(D::Error::custom(format!(
                "expected a number or \"{}\", found \"{}\"",
                UNLIMITED, word
            ))),
        }
    }
}
