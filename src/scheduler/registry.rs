use super::cron::CronExpression;
use super::runner::{EntryStatus, Scheduler};
use crate::errors::Result;
use crate::models::{NewSchedule, Schedule, ScheduleFilter, SchedulePatch};
use crate::store::Store;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Schedule CRUD. Every mutation signals the store's change feed, which
/// serving schedulers in any process follow, and rebuilds the in-process
/// scheduler when there is one. A failed signal or rebuild is logged and
/// does not fail the mutation.
pub struct ScheduleRegistry {
    store: Arc<dyn Store>,
    scheduler: Option<Arc<Scheduler>>,
}

impl ScheduleRegistry {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            scheduler: Some(scheduler),
        }
    }

    /// Registry for a process that runs no timers of its own.
    pub fn detached(store: Arc<dyn Store>) -> Self {
        Self { store, scheduler: None }
    }

    pub async fn create(&self, connection_id: i64, destination_id: i64, expr: &str) -> Result<Schedule> {
        let expression = CronExpression::parse(expr)?;
        self.store.get_connection(connection_id).await?;
        self.store.get_destination(destination_id).await?;

        let schedule = self
            .store
            .insert_schedule(NewSchedule {
                connection_id,
                destination_id,
                schedule: expression.to_string(),
                enabled: true,
                next_run: expression.next_after(Utc::now()),
            })
            .await?;
        info!(schedule_id = schedule.id, expression = %expression, "Schedule created");

        self.announce_change().await;
        Ok(schedule)
    }

    /// Applies a JSON field map (see [`SchedulePatch::from_fields`]).
    pub async fn update(&self, id: i64, fields: &Map<String, Value>) -> Result<Schedule> {
        let mut patch = SchedulePatch::from_fields(fields)?;
        self.store.get_schedule(id).await?;

        if let Some(expr) = &patch.schedule {
            let expression = CronExpression::parse(expr)?;
            patch.next_run = expression.next_after(Utc::now());
            patch.schedule = Some(expression.to_string());
        }
        if let Some(connection_id) = patch.connection_id {
            self.store.get_connection(connection_id).await?;
        }
        if let Some(destination_id) = patch.destination_id {
            self.store.get_destination(destination_id).await?;
        }

        let schedule = self.store.update_schedule(id, &patch).await?;
        info!(schedule_id = id, "Schedule updated");

        self.announce_change().await;
        Ok(schedule)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.store.delete_schedule(id).await?;
        info!(schedule_id = id, "Schedule deleted");
        self.announce_change().await;
        Ok(())
    }

    pub async fn enable(&self, id: i64) -> Result<Schedule> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: i64) -> Result<Schedule> {
        self.set_enabled(id, false).await
    }

    pub async fn get(&self, id: i64) -> Result<Schedule> {
        self.store.get_schedule(id).await
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.store.list_schedules(filter).await
    }

    /// Enabled schedules with the `next_run` last persisted for them. Reads
    /// only; schedules whose expression no longer parses are left out, as a
    /// scheduler would skip them.
    pub async fn armed(&self) -> Result<Vec<EntryStatus>> {
        let schedules = self.store.list_enabled_schedules().await?;
        Ok(schedules
            .into_iter()
            .filter_map(|schedule| match CronExpression::parse(&schedule.schedule) {
                Ok(expression) => Some(EntryStatus {
                    schedule_id: schedule.id,
                    expression: expression.to_string(),
                    next_run: schedule.next_run,
                }),
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Schedule cannot be armed");
                    None
                }
            })
            .collect())
    }

    /// Recomputes and stores `next_run` from now without touching timers.
    pub async fn recalculate_next_run(&self, id: i64) -> Result<Schedule> {
        let schedule = self.store.get_schedule(id).await?;
        let expression = CronExpression::parse(&schedule.schedule)?;
        let patch = SchedulePatch {
            next_run: expression.next_after(Utc::now()),
            ..SchedulePatch::default()
        };
        if patch.is_empty() {
            return Ok(schedule);
        }
        self.store.update_schedule(id, &patch).await
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Schedule> {
        let mut patch = SchedulePatch {
            enabled: Some(enabled),
            ..SchedulePatch::default()
        };
        if enabled {
            let current = self.store.get_schedule(id).await?;
            patch.next_run = CronExpression::parse(&current.schedule)
                .ok()
                .and_then(|expression| expression.next_after(Utc::now()));
        }
        let schedule = self.store.update_schedule(id, &patch).await?;
        info!(schedule_id = id, enabled, "Schedule toggled");
        self.announce_change().await;
        Ok(schedule)
    }

    async fn announce_change(&self) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.restart().await {
                error!(error = %e, "Failed to restart scheduler");
            }
        }
        if let Err(e) = self.store.notify_schedule_change().await {
            warn!(error = %e, "Failed to signal schedule change");
        }
    }
}
