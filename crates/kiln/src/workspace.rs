//! Per-request temporary workspace
//!
//! Holds the materialized source, compiler output and the checked-out
//! artifact of one request. Removed when the request or its session ends.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, instrument, warn};

/// Sub-directory holding the runnable artifact
pub const ARTIFACT_DIR: &str = "artifact";

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create a fresh directory under `root`
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("kiln-").tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "created workspace");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the workspace.
    ///
    /// Rejects absolute names and path traversal.
    pub fn file_path(&self, name: &str) -> io::Result<PathBuf> {
        if name.contains("..") || name.starts_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path traversal not allowed: {name}"),
            ));
        }
        Ok(self.path.join(name))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.path.join(ARTIFACT_DIR)
    }

    /// Write a file into the workspace
    #[instrument(skip(self, content))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> io::Result<PathBuf> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "wrote file to workspace");
        Ok(path)
    }

    /// Whether [`remove`](Self::remove) already ran
    pub fn is_removed(&self) -> bool {
        self.dir.is_none()
    }

    /// Delete the workspace. Only the first call does anything; returns
    /// whether this call removed it.
    pub fn remove(&mut self) -> bool {
        let Some(dir) = self.dir.take() else {
            return false;
        };
        if let Err(e) = dir.close() {
            warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
        } else {
            debug!(path = %self.path.display(), "removed workspace");
        }
        true
    }
}
