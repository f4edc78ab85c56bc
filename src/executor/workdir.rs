//! Per-execution working directories.
//!
//! Each execution gets its own subdirectory under the configured root. Names
//! are unguessable (execution id plus random suffix) so concurrent
//! executions cannot address each other's directories. A reclamation sweep
//! at startup removes prefix-matched orphans left behind by prior crashes.

use std::path::{Path, PathBuf};

use rand::Rng;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Reserved name prefix for per-execution directories.
pub const WORKDIR_PREFIX: &str = "crucible-exec-";

/// A per-execution working directory. Removed on [`Workdir::cleanup`]; the
/// `Drop` impl is a best-effort backstop for abnormal exits.
#[derive(Debug)]
pub struct Workdir {
    path: PathBuf,
    cleaned: bool,
}

impl Workdir {
    /// Create a fresh working directory under `root`.
    pub async fn create(root: &Path, execution_id: &Uuid) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..12)
                .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
                .collect()
        };

        let path = root.join(format!("{}{}-{}", WORKDIR_PREFIX, execution_id, suffix));
        tokio::fs::create_dir(&path).await?;

        Ok(Self {
            path,
            cleaned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file into the directory and return its host path.
    pub async fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf> {
        if name.contains('/') || name.contains("..") {
            return Err(Error::internal(format!(
                "workdir file name escapes directory: {}",
                name
            )));
        }
        let path = self.path.join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Remove the directory. Called on every exit path.
    pub async fn cleanup(mut self) {
        self.cleaned = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "workdir cleanup failed");
            }
        }
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Remove orphaned working directories from prior crashes. Returns the
/// number of directories removed.
pub async fn sweep_orphans(root: &Path) -> Result<usize> {
    let mut removed = 0;

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.starts_with(WORKDIR_PREFIX) && entry.file_type().await?.is_dir() {
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(dir = %entry.path().display(), "removed orphaned workdir");
                }
                Err(e) => {
                    tracing::warn!(dir = %entry.path().display(), error = %e, "orphan sweep failed");
                }
            }
        }
    }

    if removed > 0 {
        tracing::info!(count = removed, "reclaimed orphaned working directories");
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();

        let workdir = Workdir::create(root.path(), &id).await.unwrap();
        let path = workdir.path().to_path_buf();

        assert!(path.exists());
        assert!(
            path.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with(WORKDIR_PREFIX)
        );
        assert!(path.file_name().unwrap().to_str().unwrap().contains(&id.to_string()));

        workdir.cleanup().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_file() {
        let root = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(root.path(), &Uuid::new_v4()).await.unwrap();

        let path = workdir.write_file("main.js", "console.log(1)").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "console.log(1)");

        workdir.cleanup().await;
    }

    #[tokio::test]
    async fn test_write_file_rejects_escapes() {
        let root = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(root.path(), &Uuid::new_v4()).await.unwrap();

        assert!(workdir.write_file("../evil.js", "x").await.is_err());
        assert!(workdir.write_file("a/b.js", "x").await.is_err());

        workdir.cleanup().await;
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workdir = Workdir::create(root.path(), &Uuid::new_v4()).await.unwrap();
            workdir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_prefixed_dirs() {
        let root = tempfile::tempdir().unwrap();

        tokio::fs::create_dir(root.path().join("crucible-exec-orphan-1"))
            .await
            .unwrap();
        tokio::fs::create_dir(root.path().join("crucible-exec-orphan-2"))
            .await
            .unwrap();
        tokio::fs::create_dir(root.path().join("unrelated")).await.unwrap();

        let removed = sweep_orphans(root.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(root.path().join("unrelated").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_root_is_noop() {
        let removed = sweep_orphans(Path::new("/nonexistent/crucible-test"))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
