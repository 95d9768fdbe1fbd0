//! PostgreSQL backup orchestration: encrypted connection records, pg_dump /
//! pg_restore against local or S3-compatible storage, and cron scheduling.

pub mod backup;
pub mod config;
pub mod errors;
pub mod models;
pub mod restore;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod utils;
pub mod vault;
