pub mod logging;
pub mod setting;

use crate::errors::{AppError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

/// Resolves a PostgreSQL client tool, preferring an explicitly configured path.
pub fn find_executable(tool: &str, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(AppError::Config(format!(
            "{} not found at configured path {}",
            tool,
            path.display()
        )));
    }
    which(tool).map_err(|_| {
        AppError::Config(format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            tool
        ))
    })
}

/// Runs a PostgreSQL client tool with the password in `PGPASSWORD`, never on
/// the command line. A non-zero exit becomes `AppError::Subprocess`.
pub async fn run_pg_tool(program: &Path, args: &[OsString], password: &str) -> Result<()> {
    let tool = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    debug!(tool = %tool, args = ?args, "Spawning");

    let output = Command::new(program)
        .args(args)
        .env("PGPASSWORD", password)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::Subprocess {
            tool: tool.clone(),
            status: "spawn failure".to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(AppError::Subprocess {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!(tool = %tool, output = %stderr.trim(), "Tool output");
    }
    info!(tool = %tool, "Finished successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_must_exist() {
        let result = find_executable("pg_dump", Some(Path::new("/no/such/dir/pg_dump")));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_configured_path_is_used_verbatim() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let found = find_executable("pg_restore", Some(file.path()))?;
        assert_eq!(found, file.path());
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_tool_reports_stderr_and_status() {
        let sh = match which("sh") {
            Ok(path) => path,
            Err(_) => return,
        };
        let args: Vec<OsString> = vec!["-c".into(), "echo \"$PGPASSWORD\" >&2; exit 3".into()];
        let result = run_pg_tool(&sh, &args, "pw-from-env").await;
        match result {
            Err(AppError::Subprocess { tool, status, stderr }) => {
                assert_eq!(tool, "sh");
                assert!(status.contains('3'));
                assert_eq!(stderr, "pw-from-env");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_tool() {
        let sh = match which("sh") {
            Ok(path) => path,
            Err(_) => return,
        };
        let args: Vec<OsString> = vec!["-c".into(), "test \"$PGPASSWORD\" = secret".into()];
        assert!(run_pg_tool(&sh, &args, "secret").await.is_ok());
    }

    #[test]
    fn test_unknown_tool_on_path() {
        let result = find_executable("definitely-not-a-real-pg-tool-4711", None);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
