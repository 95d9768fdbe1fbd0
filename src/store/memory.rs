use super::{ChangeFeed, Store};
use crate::errors::{AppError, Result};
use crate::models::{
    Connection, ConnectionPatch, Destination, DestinationPatch, NewConnection, NewDestination, NewSchedule,
    Schedule, ScheduleFilter, SchedulePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANGE_BUFFER: usize = 16;

#[derive(Default)]
struct Tables {
    next_id: i64,
    connections: BTreeMap<i64, Connection>,
    destinations: BTreeMap<i64, Destination>,
    schedules: BTreeMap<i64, Schedule>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_connection(&self, id: i64) -> Result<()> {
        if self.connections.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::not_found("connection", id))
        }
    }

    fn require_destination(&self, id: i64) -> Result<()> {
        if self.destinations.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::not_found("destination", id))
        }
    }

    fn require_unique_name(&self, name: &str, except: Option<i64>) -> Result<()> {
        if self.destinations.values().any(|d| d.name == name && Some(d.id) != except) {
            return Err(AppError::Validation(format!("destination already exists: {}", name)));
        }
        Ok(())
    }
}

/// Process-local store with the same constraints as the PostgreSQL schema.
/// Its change feed only reaches subscribers in this process.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
        }
    }
}

struct MemoryChangeFeed {
    receiver: broadcast::Receiver<()>,
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn next_change(&mut self) -> Result<()> {
        match self.receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
            Err(broadcast::error::RecvError::Closed) => {
                Err(AppError::Storage("schedule change feed closed".to_string()))
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::Storage("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_connection(&self, new: NewConnection) -> Result<Connection> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let connection = Connection {
            id: tables.allocate_id(),
            host: new.host,
            port: new.port,
            db_name: new.db_name,
            username: new.username,
            encrypted_password: new.encrypted_password,
            created_at: now,
            updated_at: now,
        };
        tables.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn get_connection(&self, id: i64) -> Result<Connection> {
        self.lock()?
            .connections
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("connection", id))
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.lock()?.connections.values().cloned().collect())
    }

    async fn update_connection(&self, id: i64, patch: &ConnectionPatch) -> Result<Connection> {
        let mut tables = self.lock()?;
        let connection = tables
            .connections
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("connection", id))?;

        if let Some(host) = &patch.host {
            connection.host = host.clone();
        }
        if let Some(port) = patch.port {
            connection.port = port;
        }
        if let Some(db_name) = &patch.db_name {
            connection.db_name = db_name.clone();
        }
        if let Some(username) = &patch.username {
            connection.username = username.clone();
        }
        if let Some(sealed) = &patch.encrypted_password {
            connection.encrypted_password = sealed.clone();
        }
        connection.updated_at = Utc::now();
        Ok(connection.clone())
    }

    async fn delete_connection(&self, id: i64) -> Result<()> {
        let mut tables = self.lock()?;
        tables.require_connection(id)?;
        let referenced = tables.destinations.values().any(|d| d.connection_id == id)
            || tables.schedules.values().any(|s| s.connection_id == id);
        if referenced {
            return Err(AppError::Validation(format!(
                "connection {} is still referenced by destinations or schedules",
                id
            )));
        }
        tables.connections.remove(&id);
        Ok(())
    }

    async fn insert_destination(&self, new: NewDestination) -> Result<Destination> {
        let mut tables = self.lock()?;
        tables.require_connection(new.connection_id)?;
        tables.require_unique_name(&new.name, None)?;
        let now = Utc::now();
        let destination = Destination {
            id: tables.allocate_id(),
            connection_id: new.connection_id,
            name: new.name,
            endpoint_url: new.endpoint_url,
            region: new.region,
            bucket_name: new.bucket_name,
            encrypted_access_key_id: new.encrypted_access_key_id,
            encrypted_secret_access_key: new.encrypted_secret_access_key,
            path_prefix: new.path_prefix,
            use_ssl: new.use_ssl,
            verify_ssl: new.verify_ssl,
            created_at: now,
            updated_at: now,
        };
        tables.destinations.insert(destination.id, destination.clone());
        Ok(destination)
    }

    async fn get_destination(&self, id: i64) -> Result<Destination> {
        self.lock()?
            .destinations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("destination", id))
    }

    async fn list_destinations(&self, connection_id: Option<i64>) -> Result<Vec<Destination>> {
        Ok(self
            .lock()?
            .destinations
            .values()
            .filter(|d| connection_id.is_none_or(|id| d.connection_id == id))
            .cloned()
            .collect())
    }

    async fn update_destination(&self, id: i64, patch: &DestinationPatch) -> Result<Destination> {
        let mut tables = self.lock()?;
        tables.require_destination(id)?;
        if let Some(connection_id) = patch.connection_id {
            tables.require_connection(connection_id)?;
        }
        if let Some(name) = &patch.name {
            tables.require_unique_name(name, Some(id))?;
        }
        let destination = tables
            .destinations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("destination", id))?;

        if let Some(connection_id) = patch.connection_id {
            destination.connection_id = connection_id;
        }
        if let Some(name) = &patch.name {
            destination.name = name.clone();
        }
        if let Some(endpoint_url) = &patch.endpoint_url {
            destination.endpoint_url = endpoint_url.clone();
        }
        if let Some(region) = &patch.region {
            destination.region = region.clone();
        }
        if let Some(bucket_name) = &patch.bucket_name {
            destination.bucket_name = bucket_name.clone();
        }
        if let Some(sealed) = &patch.encrypted_access_key_id {
            destination.encrypted_access_key_id = sealed.clone();
        }
        if let Some(sealed) = &patch.encrypted_secret_access_key {
            destination.encrypted_secret_access_key = sealed.clone();
        }
        if let Some(path_prefix) = &patch.path_prefix {
            destination.path_prefix = path_prefix.clone();
        }
        if let Some(use_ssl) = patch.use_ssl {
            destination.use_ssl = use_ssl;
        }
        if let Some(verify_ssl) = patch.verify_ssl {
            destination.verify_ssl = verify_ssl;
        }
        destination.updated_at = Utc::now();
        Ok(destination.clone())
    }

    async fn delete_destination(&self, id: i64) -> Result<()> {
        let mut tables = self.lock()?;
        tables.require_destination(id)?;
        if tables.schedules.values().any(|s| s.destination_id == id) {
            return Err(AppError::Validation(format!(
                "destination {} is still referenced by schedules",
                id
            )));
        }
        tables.destinations.remove(&id);
        Ok(())
    }

    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let mut tables = self.lock()?;
        tables.require_connection(new.connection_id)?;
        tables.require_destination(new.destination_id)?;
        let now = Utc::now();
        let schedule = Schedule {
            id: tables.allocate_id(),
            connection_id: new.connection_id,
            destination_id: new.destination_id,
            schedule: new.schedule,
            enabled: new.enabled,
            last_run: None,
            next_run: new.next_run,
            created_at: now,
            updated_at: now,
        };
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: i64) -> Result<Schedule> {
        self.lock()?
            .schedules
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("schedule", id))
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        Ok(self
            .lock()?
            .schedules
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn update_schedule(&self, id: i64, patch: &SchedulePatch) -> Result<Schedule> {
        let mut tables = self.lock()?;
        if let Some(connection_id) = patch.connection_id {
            tables.require_connection(connection_id)?;
        }
        if let Some(destination_id) = patch.destination_id {
            tables.require_destination(destination_id)?;
        }
        let schedule = tables
            .schedules
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("schedule", id))?;

        if let Some(expr) = &patch.schedule {
            schedule.schedule = expr.clone();
        }
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        if let Some(connection_id) = patch.connection_id {
            schedule.connection_id = connection_id;
        }
        if let Some(destination_id) = patch.destination_id {
            schedule.destination_id = destination_id;
        }
        if let Some(next_run) = patch.next_run {
            schedule.next_run = Some(next_run);
        }
        schedule.updated_at = Utc::now();
        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, id: i64) -> Result<()> {
        self.lock()?
            .schedules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::not_found("schedule", id))
    }

    async fn record_run(&self, id: i64, last_run: DateTime<Utc>, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let mut tables = self.lock()?;
        let schedule = tables
            .schedules
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("schedule", id))?;
        schedule.last_run = Some(last_run);
        schedule.next_run = next_run;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn notify_schedule_change(&self) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.changes.send(());
        Ok(())
    }

    async fn schedule_changes(&self) -> Result<Box<dyn ChangeFeed>> {
        Ok(Box::new(MemoryChangeFeed {
            receiver: self.changes.subscribe(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_connection() -> NewConnection {
        NewConnection {
            host: "db.internal".to_string(),
            port: 5432,
            db_name: "orders".to_string(),
            username: "backup".to_string(),
            encrypted_password: "sealed".to_string(),
        }
    }

    fn new_destination(connection_id: i64, name: &str) -> NewDestination {
        NewDestination {
            connection_id,
            name: name.to_string(),
            endpoint_url: "https://s3.example.com".to_string(),
            region: "eu-west-1".to_string(),
            bucket_name: "backups".to_string(),
            encrypted_access_key_id: "sealed-ak".to_string(),
            encrypted_secret_access_key: "sealed-sk".to_string(),
            path_prefix: String::new(),
            use_ssl: true,
            verify_ssl: true,
        }
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let missing = store.insert_destination(new_destination(99, "offsite")).await;
        assert!(matches!(missing, Err(e) if e.is_not_found()));

        let conn = store.insert_connection(new_connection()).await?;
        let dest = store.insert_destination(new_destination(conn.id, "offsite")).await?;
        let schedule = store
            .insert_schedule(NewSchedule {
                connection_id: conn.id,
                destination_id: dest.id,
                schedule: "0 3 * * *".to_string(),
                enabled: true,
                next_run: None,
            })
            .await?;

        assert!(matches!(store.delete_connection(conn.id).await, Err(AppError::Validation(_))));
        assert!(matches!(store.delete_destination(dest.id).await, Err(AppError::Validation(_))));

        store.delete_schedule(schedule.id).await?;
        store.delete_destination(dest.id).await?;
        store.delete_connection(conn.id).await?;
        assert!(store.list_connections().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_names_are_unique() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let conn = store.insert_connection(new_connection()).await?;
        store.insert_destination(new_destination(conn.id, "offsite")).await?;
        let duplicate = store.insert_destination(new_destination(conn.id, "offsite")).await;
        assert!(matches!(duplicate, Err(AppError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_schedule_patch_and_filters() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let conn = store.insert_connection(new_connection()).await?;
        let dest = store.insert_destination(new_destination(conn.id, "offsite")).await?;
        let schedule = store
            .insert_schedule(NewSchedule {
                connection_id: conn.id,
                destination_id: dest.id,
                schedule: "0 3 * * *".to_string(),
                enabled: true,
                next_run: None,
            })
            .await?;

        let patch = SchedulePatch {
            enabled: Some(false),
            ..SchedulePatch::default()
        };
        let updated = store.update_schedule(schedule.id, &patch).await?;
        assert!(!updated.enabled);
        assert_eq!(updated.schedule, "0 3 * * *");

        assert!(store.list_enabled_schedules().await?.is_empty());
        let by_dest = store
            .list_schedules(&ScheduleFilter {
                destination_id: Some(dest.id),
                ..ScheduleFilter::default()
            })
            .await?;
        assert_eq!(by_dest.len(), 1);

        let bad = SchedulePatch {
            destination_id: Some(12345),
            ..SchedulePatch::default()
        };
        assert!(matches!(store.update_schedule(schedule.id, &bad).await, Err(e) if e.is_not_found()));
        assert!(matches!(store.update_schedule(777, &patch).await, Err(e) if e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_update_patches_only_given_columns() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let conn = store.insert_connection(new_connection()).await?;

        let patch = ConnectionPatch {
            host: Some("db2.internal".to_string()),
            encrypted_password: Some("resealed".to_string()),
            ..ConnectionPatch::default()
        };
        let updated = store.update_connection(conn.id, &patch).await?;
        assert_eq!(updated.host, "db2.internal");
        assert_eq!(updated.encrypted_password, "resealed");
        assert_eq!(updated.db_name, "orders");
        assert_eq!(updated.port, 5432);
        assert_eq!(store.get_connection(conn.id).await?.host, "db2.internal");

        assert!(matches!(store.update_connection(999, &patch).await, Err(e) if e.is_not_found()));
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_update_keeps_constraints() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let conn = store.insert_connection(new_connection()).await?;
        let offsite = store.insert_destination(new_destination(conn.id, "offsite")).await?;
        store.insert_destination(new_destination(conn.id, "archive")).await?;

        let rename_clash = DestinationPatch {
            name: Some("archive".to_string()),
            ..DestinationPatch::default()
        };
        assert!(matches!(
            store.update_destination(offsite.id, &rename_clash).await,
            Err(AppError::Validation(_))
        ));

        let orphan = DestinationPatch {
            connection_id: Some(4242),
            ..DestinationPatch::default()
        };
        assert!(matches!(store.update_destination(offsite.id, &orphan).await, Err(e) if e.is_not_found()));

        // Keeping its own name is not a clash.
        let patch = DestinationPatch {
            name: Some("offsite".to_string()),
            bucket_name: Some("backups-v2".to_string()),
            verify_ssl: Some(false),
            ..DestinationPatch::default()
        };
        let updated = store.update_destination(offsite.id, &patch).await?;
        assert_eq!(updated.bucket_name, "backups-v2");
        assert!(!updated.verify_ssl);
        assert!(updated.use_ssl);
        assert_eq!(updated.region, "eu-west-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_change_feed_receives_notifications() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.notify_schedule_change().await?;

        let mut feed = store.schedule_changes().await?;
        store.notify_schedule_change().await?;
        tokio::time::timeout(std::time::Duration::from_secs(1), feed.next_change()).await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_record_run_stamps_both_columns() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let conn = store.insert_connection(new_connection()).await?;
        let dest = store.insert_destination(new_destination(conn.id, "offsite")).await?;
        let schedule = store
            .insert_schedule(NewSchedule {
                connection_id: conn.id,
                destination_id: dest.id,
                schedule: "@hourly".to_string(),
                enabled: true,
                next_run: None,
            })
            .await?;

        let fired = Utc::now();
        let next = fired + chrono::Duration::hours(1);
        store.record_run(schedule.id, fired, Some(next)).await?;

        let reloaded = store.get_schedule(schedule.id).await?;
        assert_eq!(reloaded.last_run, Some(fired));
        assert_eq!(reloaded.next_run, Some(next));
        Ok(())
    }
}
