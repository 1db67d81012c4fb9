//! Disposable per-execution directories

use crate::error::{Result, SandboxError};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Uniquely named directory holding one program's source and artifacts.
///
/// Removed recursively by [`Workspace::destroy`] or, on any other exit
/// path, when dropped. Removal failures are logged and never surface.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create a fresh, empty directory under `root`
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            SandboxError::ResourceExhausted(format!(
                "Failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        let path = root.join(format!("coderun-{}", Uuid::new_v4()));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| {
                SandboxError::ResourceExhausted(format!(
                    "Failed to create workspace {}: {}",
                    path.display(),
                    e
                ))
            })?;

        tracing::debug!(workspace = %path.display(), "Created workspace");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `content` verbatim as `name` directly inside the workspace
    pub fn write_source(&self, name: &str, content: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::Internal(format!(
                "Invalid source file name: {:?}",
                name
            )));
        }
        let file = self.path.join(name);
        fs::write(&file, content).map_err(|e| {
            SandboxError::ResourceExhausted(format!(
                "Failed to write source file {}: {}",
                file.display(),
                e
            ))
        })?;
        Ok(file)
    }

    /// Remove the directory tree now
    pub fn destroy(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(workspace = %self.path.display(), "Removed workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    workspace = %self.path.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
