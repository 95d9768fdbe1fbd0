use crate::backup::SourceDatabase;
use crate::errors::Result;
use crate::utils::run_pg_tool;
use std::ffi::OsString;
use std::path::Path;
use tracing::info;

// -c --if-exists drops existing objects first without failing on absent ones.
pub(crate) fn restore_args(target: &SourceDatabase, input_path: &Path) -> Vec<OsString> {
    vec![
        "-h".into(),
        target.host.as_str().into(),
        "-p".into(),
        target.port.to_string().into(),
        "-U".into(),
        target.username.as_str().into(),
        "-d".into(),
        target.db_name.as_str().into(),
        "-c".into(),
        "--if-exists".into(),
        "-v".into(),
        input_path.as_os_str().to_owned(),
    ]
}

pub async fn restore_database(pg_restore: &Path, target: &SourceDatabase, input_path: &Path) -> Result<()> {
    info!(
        database = %target.label(),
        input = %input_path.display(),
        "Starting pg_restore"
    );
    run_pg_tool(pg_restore, &restore_args(target, input_path), target.password()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    #[test]
    fn test_restore_args() {
        let target = SourceDatabase::new("db.internal", 5432, "orders", "backup", Zeroizing::new("pw".to_string()));
        let args = restore_args(&target, Path::new("/tmp/in.dump"));
        let rendered: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            rendered,
            vec![
                "-h", "db.internal", "-p", "5432", "-U", "backup", "-d", "orders", "-c", "--if-exists", "-v",
                "/tmp/in.dump",
            ]
        );
    }
}
