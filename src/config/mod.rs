// backupmanager/src/config/mod.rs
use crate::errors::{AppError, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

pub const DEFAULT_BACKUP_DIR: &str = "/etc/backups";

// Structs for deserializing config.json. The secret key is deliberately absent:
// it is only ever read from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonToolsConfig {
    pub pg_dump_path: Option<PathBuf>,
    pub pg_restore_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTimeoutConfig {
    pub db_connect_secs: Option<u64>,
    pub s3_metadata_secs: Option<u64>,
    pub s3_probe_secs: Option<u64>,
    pub s3_upload_secs: Option<u64>,
    pub s3_download_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub tools: Option<JsonToolsConfig>,
    pub timeouts: Option<JsonTimeoutConfig>,
    pub log_format: Option<String>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        serde_json::from_str(&config_content).map_err(|e| {
            AppError::Config(format!(
                "Failed to parse JSON from config file at {}: {}",
                config_path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(AppError::Config(format!(
                "Unknown log format '{}', expected 'pretty' or 'json'",
                other
            ))),
        }
    }
}

/// Per-call deadlines for database probes and object-store traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub db_connect: Duration,
    pub s3_metadata: Duration,
    pub s3_probe: Duration,
    pub s3_upload: Duration,
    pub s3_download: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            db_connect: Duration::from_secs(10),
            s3_metadata: Duration::from_secs(30),
            s3_probe: Duration::from_secs(10),
            s3_upload: Duration::from_secs(60 * 60),
            s3_download: Duration::from_secs(10 * 60),
        }
    }
}

impl Timeouts {
    fn apply(mut self, raw: &JsonTimeoutConfig) -> Self {
        let secs = |v: Option<u64>, current: Duration| v.map(Duration::from_secs).unwrap_or(current);
        self.db_connect = secs(raw.db_connect_secs, self.db_connect);
        self.s3_metadata = secs(raw.s3_metadata_secs, self.s3_metadata);
        self.s3_probe = secs(raw.s3_probe_secs, self.s3_probe);
        self.s3_upload = secs(raw.s3_upload_secs, self.s3_upload);
        self.s3_download = secs(raw.s3_download_secs, self.s3_download);
        self
    }
}

// Application's internal configuration
#[derive(Clone)]
pub struct AppConfig {
    pub secret_key: Zeroizing<String>,
    pub database_url: Option<String>,
    pub local_backup_dir: PathBuf,
    pub pg_dump_path: Option<PathBuf>,
    pub pg_restore_path: Option<PathBuf>,
    pub timeouts: Timeouts,
    pub log_format: LogFormat,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("secret_key", &"[REDACTED]")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("local_backup_dir", &self.local_backup_dir)
            .field("pg_dump_path", &self.pg_dump_path)
            .field("pg_restore_path", &self.pg_restore_path)
            .field("timeouts", &self.timeouts)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl AppConfig {
    /// Loads `.env`, the optional JSON file, then the process environment.
    /// Environment values win over the file.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();
        let raw = match config_path {
            Some(path) => RawJsonConfig::load_from_json(path)?,
            None => RawJsonConfig::default(),
        };
        Self::from_sources(raw, |key| std::env::var(key).ok())
    }

    pub fn from_sources(raw: RawJsonConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let secret_key = env("SECRET_KEY")
            .map(Zeroizing::new)
            .ok_or_else(|| AppError::Config("SECRET_KEY environment variable is not set".to_string()))?;

        let database_url = env("DATABASE_URL").or(raw.database_url.filter(|s| !s.is_empty()));

        let local_backup_dir = env("LOCAL_BACKUP_DIR")
            .map(PathBuf::from)
            .or(raw.local_backup_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
        if local_backup_dir.as_os_str().is_empty() {
            return Err(AppError::Config("local_backup_dir cannot be empty".to_string()));
        }

        let tools = raw.tools.unwrap_or_default();
        let pg_dump_path = env("PG_DUMP_PATH").map(PathBuf::from).or(tools.pg_dump_path);
        let pg_restore_path = env("PG_RESTORE_PATH").map(PathBuf::from).or(tools.pg_restore_path);

        let timeouts = Timeouts::default().apply(&raw.timeouts.unwrap_or_default());

        let log_format = match env("LOG_FORMAT").or(raw.log_format) {
            Some(value) => value.parse()?,
            None => LogFormat::default(),
        };

        Ok(AppConfig {
            secret_key,
            database_url,
            local_backup_dir,
            pg_dump_path,
            pg_restore_path,
            timeouts,
            log_format,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| AppError::Config("DATABASE_URL environment variable is not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_secret_key_is_config_error() {
        let result = AppConfig::from_sources(RawJsonConfig::default(), env_from(&[]));
        assert!(matches!(result, Err(AppError::Config(_))));

        let result = AppConfig::from_sources(RawJsonConfig::default(), env_from(&[("SECRET_KEY", "  ")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let config = AppConfig::from_sources(RawJsonConfig::default(), env_from(&[("SECRET_KEY", "s3cret")]))?;

        assert_eq!(config.secret_key.as_str(), "s3cret");
        assert_eq!(config.local_backup_dir, PathBuf::from(DEFAULT_BACKUP_DIR));
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert!(config.require_database_url().is_err());
        Ok(())
    }

    #[test]
    fn test_json_values_and_env_overrides() -> anyhow::Result<()> {
        let raw: RawJsonConfig = serde_json::from_value(json!({
            "database_url": "postgres://meta@localhost/meta",
            "local_backup_dir": "/srv/backups",
            "tools": { "pg_dump_path": "/opt/pg/bin/pg_dump" },
            "timeouts": { "s3_upload_secs": 120, "db_connect_secs": 3 },
            "log_format": "json"
        }))?;

        let config = AppConfig::from_sources(
            raw,
            env_from(&[
                ("SECRET_KEY", "k"),
                ("LOCAL_BACKUP_DIR", "/var/lib/backups"),
                ("PG_RESTORE_PATH", "/usr/local/bin/pg_restore"),
            ]),
        )?;

        assert_eq!(config.require_database_url()?, "postgres://meta@localhost/meta");
        assert_eq!(config.local_backup_dir, PathBuf::from("/var/lib/backups"));
        assert_eq!(config.pg_dump_path, Some(PathBuf::from("/opt/pg/bin/pg_dump")));
        assert_eq!(config.pg_restore_path, Some(PathBuf::from("/usr/local/bin/pg_restore")));
        assert_eq!(config.timeouts.s3_upload, Duration::from_secs(120));
        assert_eq!(config.timeouts.db_connect, Duration::from_secs(3));
        assert_eq!(config.timeouts.s3_download, Timeouts::default().s3_download);
        assert_eq!(config.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn test_invalid_log_format_rejected() {
        let raw: RawJsonConfig = serde_json::from_value(json!({ "log_format": "xml" })).unwrap();
        let result = AppConfig::from_sources(raw, env_from(&[("SECRET_KEY", "k")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_debug_output_redacts_secrets() -> anyhow::Result<()> {
        let config = AppConfig::from_sources(
            RawJsonConfig::default(),
            env_from(&[
                ("SECRET_KEY", "very-secret-value"),
                ("DATABASE_URL", "postgres://u:hunter2@db/meta"),
            ]),
        )?;
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("very-secret-value"));
        assert!(!rendered.contains("hunter2"));
        Ok(())
    }

    #[test]
    fn test_load_from_json_missing_file() {
        let result = RawJsonConfig::load_from_json(Path::new("/definitely/not/here/config.json"));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
