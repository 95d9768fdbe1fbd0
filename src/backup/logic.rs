use super::SourceDatabase;
use super::db_dump::dump_database;
use super::snapshot::{snapshot_name, validate_file_name};
use crate::config::{AppConfig, Timeouts};
use crate::errors::{AppError, Result};
use crate::models::Destination;
use crate::storage::{self, BackupTarget, S3Storage, StorageBackend, StorageContext};
use crate::utils::find_executable;
use crate::utils::setting::{ConnectivityCheck, PgConnectivity};
use crate::vault::Vault;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Process-wide knobs the engine needs on every call.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backup_root: PathBuf,
    pub pg_dump: PathBuf,
    pub pg_restore: PathBuf,
    pub timeouts: Timeouts,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let pg_dump = find_executable("pg_dump", config.pg_dump_path.as_deref())?;
        let pg_restore = find_executable("pg_restore", config.pg_restore_path.as_deref())?;
        info!(pg_dump = %pg_dump.display(), pg_restore = %pg_restore.display(), "Found PostgreSQL client tools");
        Ok(Self {
            backup_root: config.local_backup_dir.clone(),
            pg_dump,
            pg_restore,
            timeouts: config.timeouts,
        })
    }
}

/// Backup operations against one source database. Holds no state between calls.
pub struct BackupManager {
    pub(crate) source: SourceDatabase,
    pub(crate) settings: Arc<EngineSettings>,
    pub(crate) vault: Arc<Vault>,
    pub(crate) connectivity: Arc<dyn ConnectivityCheck>,
}

impl BackupManager {
    pub fn new(source: SourceDatabase, settings: Arc<EngineSettings>, vault: Arc<Vault>) -> Self {
        Self {
            source,
            settings,
            vault,
            connectivity: Arc::new(PgConnectivity),
        }
    }

    /// Replaces the pre-flight connection check.
    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Opens and closes a connection to the source database.
    pub async fn check_source(&self) -> Result<()> {
        self.connectivity
            .check(&self.source.connect_options(), &self.source.label(), self.settings.timeouts.db_connect)
            .await
    }

    pub fn source(&self) -> &SourceDatabase {
        &self.source
    }

    /// `<backup_root>/<db>-<host>-<user>`
    pub fn namespace_dir(&self) -> PathBuf {
        self.settings.backup_root.join(self.source.namespace())
    }

    pub(crate) async fn open_storage(&self, target: &BackupTarget) -> Result<Box<dyn StorageBackend>> {
        let ctx = StorageContext {
            backup_root: &self.settings.backup_root,
            vault: &self.vault,
            timeouts: self.settings.timeouts,
        };
        storage::open(target, &self.source.namespace(), &ctx).await
    }

    /// Dumps the source and stores the snapshot on `target`. Returns the
    /// snapshot file name.
    pub async fn create_backup(&self, target: &BackupTarget) -> Result<String> {
        let label = self.source.label();
        self.check_source().await?;

        let backend = self.open_storage(target).await?;

        let namespace_dir = self.namespace_dir();
        tokio::fs::create_dir_all(&namespace_dir).await.map_err(|e| {
            AppError::Storage(format!("Failed to create backup directory {}: {}", namespace_dir.display(), e))
        })?;

        let name = snapshot_name(Utc::now());
        let path = namespace_dir.join(&name);
        dump_database(&self.settings.pg_dump, &self.source, &path).await?;

        if target.is_remote() {
            if let Err(e) = backend.upload(&path).await {
                error!(
                    database = %label,
                    file = %path.display(),
                    error = %e,
                    "Upload failed; keeping local copy"
                );
                return Err(e);
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %e, "Uploaded, but failed to remove local copy");
            }
        }

        info!(database = %label, backend = backend.kind(), snapshot = %name, "Backup created");
        Ok(name)
    }

    pub async fn delete_backup(&self, target: &BackupTarget, filename: &str) -> Result<()> {
        validate_file_name(filename)?;
        let backend = self.open_storage(target).await?;
        delete_with_backend(backend.as_ref(), filename).await?;
        info!(database = %self.source.label(), backend = backend.kind(), snapshot = filename, "Backup deleted");
        Ok(())
    }

    /// Snapshot names on `target`. Any failure is logged and yields an empty list.
    pub async fn list_available_backups(&self, target: &BackupTarget) -> Vec<String> {
        let listing = async {
            let backend = self.open_storage(target).await?;
            backend.list().await
        };
        match listing.await {
            Ok(names) => names,
            Err(e) => {
                warn!(database = %self.source.label(), error = %e, "Could not list backups");
                Vec::new()
            }
        }
    }

    /// Builds the object-store backend for `destination` and probes it.
    pub async fn test_destination(destination: &Destination, vault: &Vault, timeouts: Timeouts) -> bool {
        match S3Storage::from_destination(destination, vault, timeouts).await {
            Ok(backend) => backend.test_connection().await,
            Err(e) => {
                warn!(destination = %destination.name, error = %e, "Could not build storage client");
                false
            }
        }
    }
}

pub(crate) async fn delete_with_backend(backend: &dyn StorageBackend, filename: &str) -> Result<()> {
    if !backend.exists(filename).await? {
        return Err(AppError::not_found("backup", filename));
    }
    backend.delete(filename).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vault::test_vault;
    use std::path::Path;
    use zeroize::Zeroizing;

    pub(crate) fn unreachable_manager(backup_root: &Path) -> BackupManager {
        let source = SourceDatabase::new(
            "127.0.0.1",
            1,
            "orders",
            "backup",
            Zeroizing::new("hunter2".to_string()),
        );
        let settings = EngineSettings {
            backup_root: backup_root.to_path_buf(),
            pg_dump: PathBuf::from("/nonexistent/pg_dump"),
            pg_restore: PathBuf::from("/nonexistent/pg_restore"),
            timeouts: Timeouts {
                db_connect: std::time::Duration::from_secs(5),
                ..Timeouts::default()
            },
        };
        BackupManager::new(source, Arc::new(settings), Arc::new(test_vault("process-secret")))
    }

    #[test]
    fn test_settings_from_config_use_configured_tools() -> anyhow::Result<()> {
        let pg_dump = tempfile::NamedTempFile::new()?;
        let pg_restore = tempfile::NamedTempFile::new()?;
        let dump_path = pg_dump.path().to_string_lossy().into_owned();
        let restore_path = pg_restore.path().to_string_lossy().into_owned();

        let config = AppConfig::from_sources(crate::config::RawJsonConfig::default(), |key| match key {
            "SECRET_KEY" => Some("k".to_string()),
            "LOCAL_BACKUP_DIR" => Some("/var/lib/backups".to_string()),
            "PG_DUMP_PATH" => Some(dump_path.clone()),
            "PG_RESTORE_PATH" => Some(restore_path.clone()),
            _ => None,
        })?;

        let settings = EngineSettings::from_config(&config)?;
        assert_eq!(settings.pg_dump, pg_dump.path());
        assert_eq!(settings.pg_restore, pg_restore.path());
        assert_eq!(settings.backup_root, PathBuf::from("/var/lib/backups"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_source_creates_nothing() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let manager = unreachable_manager(root.path());

        let result = manager.create_backup(&BackupTarget::Local).await;
        assert!(matches!(result, Err(AppError::Connectivity(_))));
        assert!(!manager.namespace_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_backup_is_not_found() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let manager = unreachable_manager(root.path());
        std::fs::create_dir_all(manager.namespace_dir())?;

        let result = manager.delete_backup(&BackupTarget::Local, "backup_20240101_000000.dump").await;
        assert!(matches!(result, Err(e) if e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_rejects_path_traversal() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let manager = unreachable_manager(root.path());
        let result = manager.delete_backup(&BackupTarget::Local, "../../etc/passwd").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_and_delete_local() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let manager = unreachable_manager(root.path());
        assert!(manager.list_available_backups(&BackupTarget::Local).await.is_empty());

        let dir = manager.namespace_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("backup_20240102_000000.dump"), b"PGDMP")?;
        std::fs::write(dir.join("backup_20240101_000000.dump"), b"PGDMP")?;

        assert_eq!(
            manager.list_available_backups(&BackupTarget::Local).await,
            vec!["backup_20240101_000000.dump", "backup_20240102_000000.dump"]
        );

        manager.delete_backup(&BackupTarget::Local, "backup_20240101_000000.dump").await?;
        assert_eq!(
            manager.list_available_backups(&BackupTarget::Local).await,
            vec!["backup_20240102_000000.dump"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_with_bad_credentials_is_false() {
        let vault = test_vault("process-secret");
        let destination = Destination {
            id: 1,
            connection_id: 1,
            name: "offsite".to_string(),
            endpoint_url: "http://127.0.0.1:1".to_string(),
            region: String::new(),
            bucket_name: "backups".to_string(),
            encrypted_access_key_id: "not-a-ciphertext".to_string(),
            encrypted_secret_access_key: "not-a-ciphertext".to_string(),
            path_prefix: String::new(),
            use_ssl: false,
            verify_ssl: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!BackupManager::test_destination(&destination, &vault, Timeouts::default()).await);
    }
}
