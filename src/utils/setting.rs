// Connectivity probe used before any dump or restore subprocess is started.
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn check(&self, options: &PgConnectOptions, label: &str, limit: Duration) -> Result<()>;
}

/// Opens a real connection with [`check_db_connection`].
pub struct PgConnectivity;

#[async_trait]
impl ConnectivityCheck for PgConnectivity {
    async fn check(&self, options: &PgConnectOptions, label: &str, limit: Duration) -> Result<()> {
        check_db_connection(options, label, limit).await
    }
}

/// Opens a connection to `label` and closes it straight away.
pub async fn check_db_connection(options: &PgConnectOptions, label: &str, limit: Duration) -> Result<()> {
    match timeout(limit, PgConnection::connect_with(options)).await {
        Ok(Ok(conn)) => {
            if let Err(e) = conn.close().await {
                warn!(database = label, error = %e, "Connection probe did not close cleanly");
            }
            info!(database = label, "Successfully connected");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(database = label, error = %e, "Failed to connect");
            Err(AppError::Connectivity(format!("Failed to connect to {}: {}", label, e)))
        }
        Err(_) => {
            warn!(database = label, timeout_secs = limit.as_secs(), "Connection attempt timed out");
            Err(AppError::Connectivity(format!(
                "Timed out after {}s connecting to {}",
                limit.as_secs(),
                label
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_database_is_connectivity_error() {
        // Nothing listens on port 1 locally.
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("nobody")
            .password("irrelevant")
            .database("nothing");

        let result = check_db_connection(&options, "nothing@127.0.0.1:1", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AppError::Connectivity(_))));
    }
}
