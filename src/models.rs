// Records owned by the store. Encrypted columns stay ciphertext here; the vault
// decrypts them only at the point of use.
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

#[derive(Clone, sqlx::FromRow, Serialize)]
pub struct Connection {
    pub id: i64,
    pub host: String,
    pub port: i32,
    pub db_name: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Directory (and log) label for this connection: `{db}-{host}-{user}`.
    pub fn namespace(&self) -> String {
        format!("{}-{}-{}", self.db_name, self.host, self.username)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_name", &self.db_name)
            .field("username", &self.username)
            .field("encrypted_password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct NewConnection {
    pub host: String,
    pub port: i32,
    pub db_name: String,
    pub username: String,
    pub encrypted_password: String,
}

/// Column-level update for a connection. `encrypted_password` must already be
/// sealed by the vault.
#[derive(Clone, Default, PartialEq)]
pub struct ConnectionPatch {
    pub host: Option<String>,
    pub port: Option<i32>,
    pub db_name: Option<String>,
    pub username: Option<String>,
    pub encrypted_password: Option<String>,
}

impl ConnectionPatch {
    pub fn is_empty(&self) -> bool {
        *self == ConnectionPatch::default()
    }
}

/// A remote S3-compatible target attached to a connection.
#[derive(Clone, sqlx::FromRow, Serialize)]
pub struct Destination {
    pub id: i64,
    pub connection_id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    #[serde(skip_serializing)]
    pub encrypted_access_key_id: String,
    #[serde(skip_serializing)]
    pub encrypted_secret_access_key: String,
    pub path_prefix: String,
    pub use_ssl: bool,
    pub verify_ssl: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("name", &self.name)
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("credentials", &"[REDACTED]")
            .field("path_prefix", &self.path_prefix)
            .field("use_ssl", &self.use_ssl)
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

#[derive(Clone)]
pub struct NewDestination {
    pub connection_id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub encrypted_access_key_id: String,
    pub encrypted_secret_access_key: String,
    pub path_prefix: String,
    pub use_ssl: bool,
    pub verify_ssl: bool,
}

/// Column-level update for a destination. Credentials must already be sealed.
#[derive(Clone, Default, PartialEq)]
pub struct DestinationPatch {
    pub connection_id: Option<i64>,
    pub name: Option<String>,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub bucket_name: Option<String>,
    pub encrypted_access_key_id: Option<String>,
    pub encrypted_secret_access_key: Option<String>,
    pub path_prefix: Option<String>,
    pub use_ssl: Option<bool>,
    pub verify_ssl: Option<bool>,
}

impl DestinationPatch {
    pub fn is_empty(&self) -> bool {
        *self == DestinationPatch::default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Schedule {
    pub id: i64,
    pub connection_id: i64,
    pub destination_id: i64,
    /// Cron expression as the operator wrote it.
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub connection_id: i64,
    pub destination_id: i64,
    pub schedule: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// Column-level update for a schedule. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub connection_id: Option<i64>,
    pub destination_id: Option<i64>,
    pub next_run: Option<DateTime<Utc>>,
}

impl SchedulePatch {
    /// Builds a patch from a JSON field map. Only `schedule`, `enabled`,
    /// `connection_id` and `destination_id` are accepted; anything else is
    /// ignored with a warning.
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self> {
        let mut patch = SchedulePatch::default();
        for (key, value) in fields {
            match key.as_str() {
                "schedule" => {
                    let expr = value.as_str().ok_or_else(|| wrong_type(key, "a string", value))?;
                    patch.schedule = Some(expr.to_string());
                }
                "enabled" => {
                    patch.enabled = Some(value.as_bool().ok_or_else(|| wrong_type(key, "a boolean", value))?);
                }
                "connection_id" => {
                    patch.connection_id = Some(value.as_i64().ok_or_else(|| wrong_type(key, "an integer", value))?);
                }
                "destination_id" => {
                    patch.destination_id = Some(value.as_i64().ok_or_else(|| wrong_type(key, "an integer", value))?);
                }
                other => warn!(field = other, "Ignoring schedule field that cannot be updated"),
            }
        }
        if patch.is_empty() {
            return Err(AppError::Validation("no updatable schedule fields supplied".to_string()));
        }
        Ok(patch)
    }

    pub fn is_empty(&self) -> bool {
        *self == SchedulePatch::default()
    }
}

fn wrong_type(field: &str, expected: &str, got: &Value) -> AppError {
    AppError::Validation(format!("field '{}' must be {}, got {}", field, expected, got))
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub connection_id: Option<i64>,
    pub destination_id: Option<i64>,
    pub enabled: Option<bool>,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        self.connection_id.is_none_or(|id| schedule.connection_id == id)
            && self.destination_id.is_none_or(|id| schedule.destination_id == id)
            && self.enabled.is_none_or(|enabled| schedule.enabled == enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    #[test]
    fn test_patch_from_allowed_fields() -> anyhow::Result<()> {
        let patch = SchedulePatch::from_fields(&fields(json!({
            "schedule": "0 4 * * *",
            "enabled": false,
            "connection_id": 3,
            "destination_id": 9
        })))?;
        assert_eq!(
            patch,
            SchedulePatch {
                schedule: Some("0 4 * * *".to_string()),
                enabled: Some(false),
                connection_id: Some(3),
                destination_id: Some(9),
                next_run: None,
            }
        );
        Ok(())
    }

    #[test]
    fn test_unknown_fields_are_ignored() -> anyhow::Result<()> {
        let patch = SchedulePatch::from_fields(&fields(json!({
            "enabled": true,
            "last_run": "2024-01-01T00:00:00Z",
            "id": 42
        })))?;
        assert_eq!(patch.enabled, Some(true));
        assert_eq!(patch.schedule, None);
        Ok(())
    }

    #[test]
    fn test_only_unknown_fields_is_rejected() {
        let result = SchedulePatch::from_fields(&fields(json!({ "next_run": null, "owner": "ops" })));
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(matches!(SchedulePatch::from_fields(&Map::new()), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        for bad in [
            json!({ "enabled": "yes" }),
            json!({ "schedule": 5 }),
            json!({ "connection_id": "3" }),
            json!({ "destination_id": 1.5 }),
        ] {
            let result = SchedulePatch::from_fields(&fields(bad.clone()));
            assert!(matches!(result, Err(AppError::Validation(_))), "{} accepted", bad);
        }
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let schedule = Schedule {
            id: 1,
            connection_id: 2,
            destination_id: 3,
            schedule: "@daily".to_string(),
            enabled: true,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        };
        assert!(ScheduleFilter::default().matches(&schedule));
        assert!(ScheduleFilter { connection_id: Some(2), enabled: Some(true), ..Default::default() }.matches(&schedule));
        assert!(!ScheduleFilter { destination_id: Some(4), ..Default::default() }.matches(&schedule));
        assert!(!ScheduleFilter { enabled: Some(false), ..Default::default() }.matches(&schedule));
    }
}
