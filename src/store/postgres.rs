use super::{ChangeFeed, Store};
use crate::errors::{AppError, Result};
use crate::models::{
    Connection, ConnectionPatch, Destination, DestinationPatch, NewConnection, NewDestination, NewSchedule,
    Schedule, ScheduleFilter, SchedulePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// NOTIFY channel for schedule edits.
pub const SCHEDULE_CHANNEL: &str = "backupmanager_schedules";

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS connections (
        id BIGSERIAL PRIMARY KEY,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        db_name TEXT NOT NULL,
        username TEXT NOT NULL,
        encrypted_password TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS destinations (
        id BIGSERIAL PRIMARY KEY,
        connection_id BIGINT NOT NULL REFERENCES connections(id),
        name VARCHAR(255) NOT NULL UNIQUE,
        endpoint_url VARCHAR(500) NOT NULL,
        region VARCHAR(100) NOT NULL DEFAULT '',
        bucket_name VARCHAR(255) NOT NULL,
        encrypted_access_key_id TEXT NOT NULL,
        encrypted_secret_access_key TEXT NOT NULL,
        path_prefix VARCHAR(500) NOT NULL DEFAULT '',
        use_ssl BOOLEAN NOT NULL DEFAULT true,
        verify_ssl BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS destinations_connection_id_idx ON destinations (connection_id)",
    r#"CREATE TABLE IF NOT EXISTS schedules (
        id BIGSERIAL PRIMARY KEY,
        connection_id BIGINT NOT NULL REFERENCES connections(id),
        destination_id BIGINT NOT NULL REFERENCES destinations(id),
        schedule VARCHAR(100) NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT true,
        last_run TIMESTAMPTZ,
        next_run TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS schedules_enabled_idx ON schedules (enabled)",
];

/// Record store on the metadata PostgreSQL database named by `DATABASE_URL`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Connectivity(format!("Failed to connect to metadata database: {}", e)))?;
        Ok(Self { pool })
    }

    /// Creates the tables when they are missing. Safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Metadata schema is up to date");
        Ok(())
    }
}

struct PgChangeFeed {
    listener: PgListener,
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn next_change(&mut self) -> Result<()> {
        // `None` means the listener reconnected and may have missed notifications.
        if self.listener.try_recv().await?.is_none() {
            warn!(channel = SCHEDULE_CHANNEL, "Schedule listener reconnected");
        }
        Ok(())
    }
}

fn map_write_error(err: sqlx::Error, what: &str) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return AppError::Validation(format!("{} already exists: {}", what, db_err.message()));
        }
        if db_err.is_foreign_key_violation() {
            return AppError::Validation(format!("{} references missing or dependent rows: {}", what, db_err.message()));
        }
    }
    AppError::Sqlx(err)
}

#[async_trait]
impl Store for PgStore {
    async fn insert_connection(&self, new: NewConnection) -> Result<Connection> {
        sqlx::query_as::<_, Connection>(
            "INSERT INTO connections (host, port, db_name, username, encrypted_password)
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&new.host)
        .bind(new.port)
        .bind(&new.db_name)
        .bind(&new.username)
        .bind(&new.encrypted_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "connection"))
    }

    async fn get_connection(&self, id: i64) -> Result<Connection> {
        sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("connection", id))
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(sqlx::query_as::<_, Connection>("SELECT * FROM connections ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_connection(&self, id: i64, patch: &ConnectionPatch) -> Result<Connection> {
        sqlx::query_as::<_, Connection>(
            "UPDATE connections SET
                 host = COALESCE($2, host),
                 port = COALESCE($3, port),
                 db_name = COALESCE($4, db_name),
                 username = COALESCE($5, username),
                 encrypted_password = COALESCE($6, encrypted_password),
                 updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.host.as_deref())
        .bind(patch.port)
        .bind(patch.db_name.as_deref())
        .bind(patch.username.as_deref())
        .bind(patch.encrypted_password.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "connection"))?
        .ok_or_else(|| AppError::not_found("connection", id))
    }

    async fn delete_connection(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM connections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, "connection"))?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("connection", id));
        }
        Ok(())
    }

    async fn insert_destination(&self, new: NewDestination) -> Result<Destination> {
        sqlx::query_as::<_, Destination>(
            "INSERT INTO destinations (connection_id, name, endpoint_url, region, bucket_name,
                 encrypted_access_key_id, encrypted_secret_access_key, path_prefix, use_ssl, verify_ssl)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
        )
        .bind(new.connection_id)
        .bind(&new.name)
        .bind(&new.endpoint_url)
        .bind(&new.region)
        .bind(&new.bucket_name)
        .bind(&new.encrypted_access_key_id)
        .bind(&new.encrypted_secret_access_key)
        .bind(&new.path_prefix)
        .bind(new.use_ssl)
        .bind(new.verify_ssl)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "destination"))
    }

    async fn get_destination(&self, id: i64) -> Result<Destination> {
        sqlx::query_as::<_, Destination>("SELECT * FROM destinations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn list_destinations(&self, connection_id: Option<i64>) -> Result<Vec<Destination>> {
        Ok(sqlx::query_as::<_, Destination>(
            "SELECT * FROM destinations WHERE ($1::BIGINT IS NULL OR connection_id = $1) ORDER BY id",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_destination(&self, id: i64, patch: &DestinationPatch) -> Result<Destination> {
        sqlx::query_as::<_, Destination>(
            "UPDATE destinations SET
                 connection_id = COALESCE($2, connection_id),
                 name = COALESCE($3, name),
                 endpoint_url = COALESCE($4, endpoint_url),
                 region = COALESCE($5, region),
                 bucket_name = COALESCE($6, bucket_name),
                 encrypted_access_key_id = COALESCE($7, encrypted_access_key_id),
                 encrypted_secret_access_key = COALESCE($8, encrypted_secret_access_key),
                 path_prefix = COALESCE($9, path_prefix),
                 use_ssl = COALESCE($10, use_ssl),
                 verify_ssl = COALESCE($11, verify_ssl),
                 updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.connection_id)
        .bind(patch.name.as_deref())
        .bind(patch.endpoint_url.as_deref())
        .bind(patch.region.as_deref())
        .bind(patch.bucket_name.as_deref())
        .bind(patch.encrypted_access_key_id.as_deref())
        .bind(patch.encrypted_secret_access_key.as_deref())
        .bind(patch.path_prefix.as_deref())
        .bind(patch.use_ssl)
        .bind(patch.verify_ssl)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "destination"))?
        .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn delete_destination(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM destinations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, "destination"))?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("destination", id));
        }
        Ok(())
    }

    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>(
            "INSERT INTO schedules (connection_id, destination_id, schedule, enabled, next_run)
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(new.connection_id)
        .bind(new.destination_id)
        .bind(&new.schedule)
        .bind(new.enabled)
        .bind(new.next_run)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "schedule"))
    }

    async fn get_schedule(&self, id: i64) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("schedule", id))
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        Ok(sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules
             WHERE ($1::BIGINT IS NULL OR connection_id = $1)
               AND ($2::BIGINT IS NULL OR destination_id = $2)
               AND ($3::BOOLEAN IS NULL OR enabled = $3)
             ORDER BY id",
        )
        .bind(filter.connection_id)
        .bind(filter.destination_id)
        .bind(filter.enabled)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_schedule(&self, id: i64, patch: &SchedulePatch) -> Result<Schedule> {
        sqlx::query_as::<_, Schedule>(
            "UPDATE schedules SET
                 schedule = COALESCE($2, schedule),
                 enabled = COALESCE($3, enabled),
                 connection_id = COALESCE($4, connection_id),
                 destination_id = COALESCE($5, destination_id),
                 next_run = COALESCE($6, next_run),
                 updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(patch.schedule.as_deref())
        .bind(patch.enabled)
        .bind(patch.connection_id)
        .bind(patch.destination_id)
        .bind(patch.next_run)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "schedule"))?
        .ok_or_else(|| AppError::not_found("schedule", id))
    }

    async fn delete_schedule(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("schedule", id));
        }
        Ok(())
    }

    async fn record_run(&self, id: i64, last_run: DateTime<Utc>, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedules SET last_run = $2, next_run = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(last_run)
        .bind(next_run)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("schedule", id));
        }
        Ok(())
    }

    async fn notify_schedule_change(&self) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(SCHEDULE_CHANNEL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn schedule_changes(&self) -> Result<Box<dyn ChangeFeed>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(SCHEDULE_CHANNEL).await?;
        info!(channel = SCHEDULE_CHANNEL, "Listening for schedule changes");
        Ok(Box::new(PgChangeFeed { listener }))
    }
}
