pub mod cron;
mod registry;
mod runner;

pub use self::cron::CronExpression;
pub use registry::ScheduleRegistry;
pub use runner::{BackupRunner, EngineRunner, EntryStatus, Scheduler, SchedulerStatus};
