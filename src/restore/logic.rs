use super::db_restore::restore_database;
use crate::backup::BackupManager;
use crate::backup::snapshot::validate_file_name;
use crate::errors::{AppError, Result};
use crate::storage::{BackupTarget, StorageBackend};
use std::path::Path;
use tracing::{info, warn};

impl BackupManager {
    /// Restores `filename` from `target` into the source database, replacing
    /// existing objects.
    pub async fn restore_from_backup(&self, target: &BackupTarget, filename: &str) -> Result<()> {
        validate_file_name(filename)?;
        let backend = self.open_storage(target).await?;
        self.restore_with_backend(backend.as_ref(), target.is_remote(), filename).await
    }

    pub(crate) async fn restore_with_backend(
        &self,
        backend: &dyn StorageBackend,
        remote: bool,
        filename: &str,
    ) -> Result<()> {
        if !backend.exists(filename).await? {
            return Err(AppError::not_found("backup", filename));
        }

        let namespace_dir = self.namespace_dir();
        if !remote {
            return self.restore_file(&namespace_dir.join(filename)).await;
        }

        tokio::fs::create_dir_all(&namespace_dir).await?;
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .suffix(".dump")
            .tempfile_in(&namespace_dir)?;

        let result = async {
            backend.download(filename, staging.path()).await?;
            info!(snapshot = filename, staging = %staging.path().display(), "Downloaded for restore");
            self.restore_file(staging.path()).await
        }
        .await;

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            warn!(staging = %staging_path.display(), error = %e, "Failed to remove staging file");
        }
        result
    }

    async fn restore_file(&self, path: &Path) -> Result<()> {
        let label = self.source.label();
        self.check_source().await?;
        restore_database(&self.settings.pg_restore, &self.source, path).await?;
        info!(database = %label, file = %path.display(), "Restore finished");
        Ok(())
    }
}
