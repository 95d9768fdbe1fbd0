//! Record store for connections, destinations and schedules.
//!
//! `PgStore` is the production backend; `MemoryStore` backs the scheduler
//! and registry tests. Both enforce the same constraints: a destination or
//! schedule must reference existing rows, destination names are unique, and
//! referenced rows cannot be deleted.
//!
//! Both also carry a schedule change feed so that a serving scheduler reloads
//! when another process edits schedules. `PgStore` uses LISTEN/NOTIFY on
//! [`SCHEDULE_CHANNEL`].

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, SCHEDULE_CHANNEL};

use crate::errors::Result;
use crate::models::{
    Connection, ConnectionPatch, Destination, DestinationPatch, NewConnection, NewDestination, NewSchedule,
    Schedule, ScheduleFilter, SchedulePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Stream of "schedules changed" signals.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Resolves on the next change. A dropped listener connection counts as a
    /// change, since notifications may have been lost while it was down.
    async fn next_change(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_connection(&self, new: NewConnection) -> Result<Connection>;
    async fn get_connection(&self, id: i64) -> Result<Connection>;
    async fn list_connections(&self) -> Result<Vec<Connection>>;
    async fn update_connection(&self, id: i64, patch: &ConnectionPatch) -> Result<Connection>;
    async fn delete_connection(&self, id: i64) -> Result<()>;

    async fn insert_destination(&self, new: NewDestination) -> Result<Destination>;
    async fn get_destination(&self, id: i64) -> Result<Destination>;
    async fn list_destinations(&self, connection_id: Option<i64>) -> Result<Vec<Destination>>;
    async fn update_destination(&self, id: i64, patch: &DestinationPatch) -> Result<Destination>;
    async fn delete_destination(&self, id: i64) -> Result<()>;

    async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule>;
    async fn get_schedule(&self, id: i64) -> Result<Schedule>;
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>>;
    async fn update_schedule(&self, id: i64, patch: &SchedulePatch) -> Result<Schedule>;
    async fn delete_schedule(&self, id: i64) -> Result<()>;

    /// Stamps a fire: `last_run` and the following `next_run` in one write.
    async fn record_run(&self, id: i64, last_run: DateTime<Utc>, next_run: Option<DateTime<Utc>>) -> Result<()>;

    /// Signals every [`ChangeFeed`] on this store, in any process.
    async fn notify_schedule_change(&self) -> Result<()>;
    async fn schedule_changes(&self) -> Result<Box<dyn ChangeFeed>>;

    async fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        self.list_schedules(&ScheduleFilter {
            enabled: Some(true),
            ..ScheduleFilter::default()
        })
        .await
    }
}
