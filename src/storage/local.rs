use super::StorageBackend;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Snapshots kept in `<backup_root>/<namespace>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, local_path: &Path) -> Result<()> {
        // The dump tool already wrote into the namespace directory.
        debug!(path = %local_path.display(), "Local target, nothing to upload");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(AppError::not_found("backup directory", self.root.display()));
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                AppError::Storage(format!("Failed to read {}: {}", self.root.display(), e))
            })?;
            if entry.file_type().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn download(&self, name: &str, dest_path: &Path) -> Result<()> {
        let source = self.root.join(name);
        if !tokio::fs::try_exists(&source).await? {
            return Err(AppError::not_found("backup", name));
        }
        tokio::fs::copy(&source, dest_path).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        if !tokio::fs::try_exists(&path).await? {
            return Err(AppError::not_found("backup", name));
        }
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.root.join(name)).await?)
    }

    async fn test_connection(&self) -> bool {
        match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Backup directory is not usable");
                false
            }
        }
    }
}
