//! Local scratch storage for downloads, compiled templates and renders.

use crate::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub async fn new(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Reserve a unique path; nothing is created on disk.
    pub fn artifact(&self, stem: &str, extension: Option<&str>) -> TempArtifact {
        let name = match extension {
            Some(ext) => format!("{}_{}.{}", stem, Uuid::new_v4(), ext),
            None => format!("{}_{}", stem, Uuid::new_v4()),
        };
        TempArtifact::adopt(self.dir.join(name))
    }
}

/// A scratch file owned by one operation.
///
/// Call [`TempArtifact::remove`] when the operation ends. If the owner is
/// dropped first (cancellation, panic) the file is removed synchronously.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    removed: bool,
}

impl TempArtifact {
    /// Take ownership of an existing path, e.g. a file written by the transport layer.
    pub fn adopt(path: PathBuf) -> Self {
        Self {
            path,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up ownership without removing the file; the new owner cleans up.
    pub fn into_path(mut self) -> PathBuf {
        self.removed = true;
        std::mem::take(&mut self.path)
    }

    /// Remove the file. Errors are logged, never returned; a file that was
    /// never written is not an error.
    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_artifact_paths_are_unique() {
        let dir = tempdir().unwrap();
        let scratch = Scratch::new(dir.path()).await.unwrap();

        let a = scratch.artifact("render", Some("jpg"));
        let b = scratch.artifact("render", Some("jpg"));
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(dir.path()));
        assert!(a.path().to_string_lossy().ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_remove_and_missing_file() {
        let dir = tempdir().unwrap();
        let scratch = Scratch::new(&dir.path().join("nested")).await.unwrap();

        let artifact = scratch.artifact("x", None);
        let path = artifact.path().to_path_buf();
        std::fs::write(&path, b"data").unwrap();
        artifact.remove().await;
        assert!(!path.exists());

        // Never written: removal is a no-op.
        scratch.artifact("y", None).remove().await;
    }

    #[tokio::test]
    async fn test_into_path_hands_off_file() {
        let dir = tempdir().unwrap();
        let scratch = Scratch::new(dir.path()).await.unwrap();

        let artifact = scratch.artifact("staged", None);
        std::fs::write(artifact.path(), b"data").unwrap();
        let path = artifact.into_path();
        assert!(path.exists());

        TempArtifact::adopt(path.clone()).remove().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_file() {
        let dir = tempdir().unwrap();
        let scratch = Scratch::new(dir.path()).await.unwrap();

        let path = {
            let artifact = scratch.artifact("dropped", None);
            std::fs::write(artifact.path(), b"data").unwrap();
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
