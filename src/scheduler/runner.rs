use super::cron::CronExpression;
use crate::backup::{BackupManager, EngineSettings, SourceDatabase};
use crate::errors::Result;
use crate::models::{Schedule, SchedulePatch};
use crate::storage::BackupTarget;
use crate::store::{ChangeFeed, Store};
use crate::vault::Vault;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a schedule does when it fires.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run(&self, schedule: &Schedule) -> Result<String>;
}

/// Runs the backup engine against the schedule's current connection and
/// destination rows, one dump per connection at a time.
pub struct EngineRunner {
    store: Arc<dyn Store>,
    settings: Arc<EngineSettings>,
    vault: Arc<Vault>,
    locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl EngineRunner {
    pub fn new(store: Arc<dyn Store>, settings: Arc<EngineSettings>, vault: Arc<Vault>) -> Self {
        Self {
            store,
            settings,
            vault,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, connection_id: i64) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(connection_id).or_default().clone()
    }
}

#[async_trait]
impl BackupRunner for EngineRunner {
    async fn run(&self, schedule: &Schedule) -> Result<String> {
        let connection = self.store.get_connection(schedule.connection_id).await?;
        let destination = self.store.get_destination(schedule.destination_id).await?;

        let lock = self.lock_for(connection.id);
        let _guard = lock.lock().await;

        let source = SourceDatabase::from_connection(&connection, &self.vault)?;
        let manager = BackupManager::new(source, self.settings.clone(), self.vault.clone());
        manager.create_backup(&BackupTarget::ObjectStore(destination)).await
    }
}

struct Entry {
    schedule_id: i64,
    expression: CronExpression,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub schedule_id: i64,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub entries: Vec<EntryStatus>,
}

/// Live timer registry. One value per process, shared through `Arc`.
pub struct Scheduler {
    store: Arc<dyn Store>,
    runner: Arc<dyn BackupRunner>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn BackupRunner>) -> Self {
        Self {
            store,
            runner,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Loads every enabled schedule and arms its timer. No-op when running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            debug!("Scheduler already running");
            return Ok(());
        }
        self.rebuild(&mut state, Utc::now()).await?;
        info!(entries = state.entries.len(), "Scheduler started");
        Ok(())
    }

    /// Aborts all timers. Backups already running are left to finish.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        clear(&mut state);
        info!("Scheduler stopped");
    }

    pub async fn restart(&self) -> Result<()> {
        self.reload_at(Utc::now()).await
    }

    /// Stop, reload from the store and start, with every `next_run`
    /// computed from `now`.
    pub async fn reload_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        clear(&mut state);
        self.rebuild(&mut state, now).await?;
        info!(entries = state.entries.len(), "Scheduler restarted");
        Ok(())
    }

    /// Restarts the scheduler on every signal from `feed`, including changes
    /// made by other processes. Ends when the feed fails or the scheduler is
    /// dropped.
    pub fn follow_changes(self: &Arc<Self>, mut feed: Box<dyn ChangeFeed>) -> JoinHandle<()> {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = feed.next_change().await {
                    error!(error = %e, "Schedule change feed failed; live reload stopped");
                    break;
                }
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                info!("Schedules changed; reloading");
                if let Err(e) = scheduler.restart().await {
                    error!(error = %e, "Failed to reload scheduler");
                }
            }
        })
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        let now = Utc::now();
        SchedulerStatus {
            running: state.running,
            entries: state
                .entries
                .iter()
                .map(|entry| EntryStatus {
                    schedule_id: entry.schedule_id,
                    expression: entry.expression.to_string(),
                    next_run: entry.expression.next_after(now),
                })
                .collect(),
        }
    }

    async fn rebuild(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Result<()> {
        let schedules = self.store.list_enabled_schedules().await?;

        for schedule in schedules {
            let expression = match CronExpression::parse(&schedule.schedule) {
                Ok(expression) => expression,
                Err(e) => {
                    error!(schedule_id = schedule.id, error = %e, "Skipping schedule with invalid expression");
                    continue;
                }
            };

            let Some(next_run) = expression.next_after(now) else {
                warn!(schedule_id = schedule.id, expression = %expression, "Schedule has no future fire time");
                continue;
            };

            let patch = SchedulePatch {
                next_run: Some(next_run),
                ..SchedulePatch::default()
            };
            if let Err(e) = self.store.update_schedule(schedule.id, &patch).await {
                warn!(schedule_id = schedule.id, error = %e, "Failed to persist next run");
            }

            let handle = spawn_timer(
                self.store.clone(),
                self.runner.clone(),
                schedule.id,
                expression.clone(),
                next_run,
            );
            debug!(schedule_id = schedule.id, next_run = %next_run, "Timer armed");
            state.entries.push(Entry {
                schedule_id: schedule.id,
                expression,
                handle,
            });
        }

        state.running = true;
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.state.get_mut().entries.drain(..) {
            entry.handle.abort();
        }
    }
}

fn clear(state: &mut SchedulerState) {
    for entry in state.entries.drain(..) {
        entry.handle.abort();
    }
    state.running = false;
}

fn spawn_timer(
    store: Arc<dyn Store>,
    runner: Arc<dyn BackupRunner>,
    schedule_id: i64,
    expression: CronExpression,
    first: DateTime<Utc>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = first;
        loop {
            sleep_until(next).await;

            let fired_at = Utc::now().max(next);
            let following = expression.next_after(fired_at);
            tokio::spawn(fire(store.clone(), runner.clone(), schedule_id, fired_at, following));

            match following {
                Some(t) => next = t,
                None => {
                    warn!(schedule_id, "Schedule has no further fire times");
                    break;
                }
            }
        }
    })
}

/// Sleeps until the wall clock reaches `target`. Tokio timers follow the
/// monotonic clock, which may run ahead of wall time.
async fn sleep_until(target: DateTime<Utc>) {
    while let Ok(wait) = (target - Utc::now()).to_std() {
        if wait.is_zero() {
            break;
        }
        tokio::time::sleep(wait).await;
    }
}

async fn fire(
    store: Arc<dyn Store>,
    runner: Arc<dyn BackupRunner>,
    schedule_id: i64,
    fired_at: DateTime<Utc>,
    following: Option<DateTime<Utc>>,
) {
    if let Err(e) = store.record_run(schedule_id, fired_at, following).await {
        error!(schedule_id, error = %e, "Failed to record run");
    }

    let schedule = match store.get_schedule(schedule_id).await {
        Ok(schedule) if schedule.enabled => schedule,
        Ok(_) => {
            info!(schedule_id, "Schedule disabled since it was armed; skipping");
            return;
        }
        Err(e) => {
            error!(schedule_id, error = %e, "Could not load schedule");
            return;
        }
    };

    info!(
        schedule_id,
        connection_id = schedule.connection_id,
        destination_id = schedule.destination_id,
        "Scheduled backup starting"
    );
    match runner.run(&schedule).await {
        Ok(snapshot) => info!(schedule_id, snapshot = %snapshot, "Scheduled backup finished"),
        Err(e) => error!(schedule_id, error = %e, "Scheduled backup failed"),
    }
}
