pub(crate) mod db_dump;
pub(crate) mod logic;
pub mod snapshot;

pub use logic::{BackupManager, EngineSettings};

use crate::errors::{AppError, Result};
use crate::models::Connection;
use crate::vault::Vault;
use sqlx::postgres::PgConnectOptions;
use std::fmt;
use zeroize::Zeroizing;

/// The database being backed up or restored into, with its password in the clear.
pub struct SourceDatabase {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub username: String,
    password: Zeroizing<String>,
}

impl fmt::Debug for SourceDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDatabase")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_name", &self.db_name)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl SourceDatabase {
    pub fn new(host: &str, port: u16, db_name: &str, username: &str, password: Zeroizing<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            db_name: db_name.to_string(),
            username: username.to_string(),
            password,
        }
    }

    /// Decrypts the stored password of `connection`.
    pub fn from_connection(connection: &Connection, vault: &Vault) -> Result<Self> {
        let port = u16::try_from(connection.port)
            .map_err(|_| AppError::Validation(format!("Invalid port {} on connection {}", connection.port, connection.id)))?;
        let password = vault.decrypt_string(&connection.encrypted_password)?;
        Ok(Self::new(&connection.host, port, &connection.db_name, &connection.username, password))
    }

    /// `{db}-{host}-{user}`, the per-source directory name.
    pub fn namespace(&self) -> String {
        format!("{}-{}-{}", self.db_name, self.host, self.username)
    }

    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.db_name, self.host, self.port)
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(self.password.as_str())
            .database(&self.db_name)
    }
}
