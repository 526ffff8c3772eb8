//! Remote storage capability used by the sync agent.
//!
//! Nothing transactional is assumed of the remote: only "put this object under
//! this name" and "does this name exist". Object names are deterministic, so a
//! repeated put after a lost commit overwrites rather than duplicates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload a local file as `name`; returns the remote reference to record.
    async fn put_file(&self, name: &str, local: &Path) -> std::io::Result<String>;

    /// Upload an in-memory snapshot as `name`.
    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> std::io::Result<String>;

    async fn exists(&self, name: &str) -> std::io::Result<bool>;

    /// Get backend description for logging
    fn describe(&self) -> String;
}

/// A remote mounted as a directory (network share, removable disk).
///
/// Objects are written to a hidden `.partial` sibling and renamed into place,
/// so a dropped link never leaves a truncated object under its final name.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        let dest = self.object_path(name);
        let file = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{}.partial", file))
    }

    async fn prepare(&self, name: &str) -> std::io::Result<PathBuf> {
        let dest = self.object_path(name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(dest)
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemote {
    async fn put_file(&self, name: &str, local: &Path) -> std::io::Result<String> {
        let dest = self.prepare(name).await?;
        let local_len = tokio::fs::metadata(local).await?.len();

        if self.exists(name).await? && tokio::fs::metadata(&dest).await?.len() == local_len {
            log::debug!("Remote object {} already present", name);
            return Ok(name.to_string());
        }

        let partial = self.partial_path(name);
        tokio::fs::copy(local, &partial).await?;
        tokio::fs::File::open(&partial).await?.sync_all().await?;
        tokio::fs::rename(&partial, &dest).await?;
        Ok(name.to_string())
    }

    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> std::io::Result<String> {
        let dest = self.prepare(name).await?;
        let partial = self.partial_path(name);
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &dest).await?;
        Ok(name.to_string())
    }

    async fn exists(&self, name: &str) -> std::io::Result<bool> {
        tokio::fs::try_exists(self.object_path(name)).await
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}
