//! Where snapshot files live once the dump tool has written them.
//!
//! Two backends: the local namespace directory and an S3-compatible bucket.
//! The engine only talks to [`StorageBackend`]; [`open`] picks the
//! implementation from a [`BackupTarget`].

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::config::Timeouts;
use crate::errors::Result;
use crate::models::Destination;
use crate::vault::Vault;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short label for logs, e.g. `local` or `s3`.
    fn kind(&self) -> &'static str;

    /// Stores `local_path` under its base name.
    async fn upload(&self, local_path: &Path) -> Result<()>;

    /// Snapshot names, sorted ascending.
    async fn list(&self) -> Result<Vec<String>>;

    async fn download(&self, name: &str, dest_path: &Path) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Never errors; an unreachable backend reports `false`.
    async fn test_connection(&self) -> bool;
}

/// Where a backup goes, or comes from.
#[derive(Debug, Clone)]
pub enum BackupTarget {
    Local,
    ObjectStore(Destination),
}

impl BackupTarget {
    pub fn is_remote(&self) -> bool {
        matches!(self, BackupTarget::ObjectStore(_))
    }
}

/// What a backend needs besides the target itself.
pub struct StorageContext<'a> {
    pub backup_root: &'a Path,
    pub vault: &'a Vault,
    pub timeouts: Timeouts,
}

pub async fn open(target: &BackupTarget, namespace: &str, ctx: &StorageContext<'_>) -> Result<Box<dyn StorageBackend>> {
    match target {
        BackupTarget::Local => Ok(Box::new(LocalStorage::new(ctx.backup_root.join(namespace)))),
        BackupTarget::ObjectStore(destination) => {
            let backend = S3Storage::from_destination(destination, ctx.vault, ctx.timeouts).await?;
            Ok(Box::new(backend))
        }
    }
}
