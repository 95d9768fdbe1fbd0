// pg_dump in custom format (-Fc) into a single snapshot file.
use super::SourceDatabase;
use crate::errors::Result;
use crate::utils::run_pg_tool;
use std::ffi::OsString;
use std::path::Path;
use tracing::{info, warn};

pub(crate) fn dump_args(source: &SourceDatabase, output_path: &Path) -> Vec<OsString> {
    vec![
        "-h".into(),
        source.host.as_str().into(),
        "-p".into(),
        source.port.to_string().into(),
        "-U".into(),
        source.username.as_str().into(),
        "-d".into(),
        source.db_name.as_str().into(),
        "-W".into(),
        "-Fc".into(),
        "-f".into(),
        output_path.as_os_str().to_owned(),
    ]
}

/// Dumps `source` into `output_path`. On failure the partial file is removed.
pub async fn dump_database(pg_dump: &Path, source: &SourceDatabase, output_path: &Path) -> Result<()> {
    info!(
        database = %source.label(),
        output = %output_path.display(),
        "Starting pg_dump"
    );

    let result = run_pg_tool(pg_dump, &dump_args(source, output_path), source.password()).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(output = %output_path.display(), error = %e, "Failed to remove partial dump");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use tempfile::tempdir;
    use zeroize::Zeroizing;

    fn source() -> SourceDatabase {
        SourceDatabase::new("db.internal", 6543, "orders", "backup", Zeroizing::new("hunter2".to_string()))
    }

    #[test]
    fn test_dump_args_keep_password_out_of_argv() {
        let args = dump_args(&source(), Path::new("/srv/backups/x/backup_20240101_000000.dump"));
        let rendered: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            rendered,
            vec![
                "-h", "db.internal", "-p", "6543", "-U", "backup", "-d", "orders", "-W", "-Fc", "-f",
                "/srv/backups/x/backup_20240101_000000.dump",
            ]
        );
        assert!(!rendered.iter().any(|a| a.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_failed_dump_removes_partial_file() -> anyhow::Result<()> {
        let false_bin = match which::which("false") {
            Ok(path) => path,
            Err(_) => return Ok(()),
        };
        let dir = tempdir()?;
        let output = dir.path().join("backup_20240101_000000.dump");
        std::fs::write(&output, b"partial")?;

        let result = dump_database(&false_bin, &source(), &output).await;
        assert!(matches!(result, Err(AppError::Subprocess { .. })));
        assert!(!output.exists());
        Ok(())
    }
}
