use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or malformed process configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied something unusable (bad cron expression, bad field).
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Source database or object store unreachable. Callers may retry.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Native dump/restore tool exited unsuccessfully. Never retried here.
    #[error("{tool} failed with {status}: {stderr}")]
    Subprocess {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl AppError {
    pub fn not_found(kind: &'static str, name: impl ToString) -> Self {
        AppError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
