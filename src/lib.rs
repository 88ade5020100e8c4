//! splitfetch core library
//!
//! Segmented, resumable HTTP downloads: a file is split into byte ranges
//! fetched in parallel, checkpointed durably, merged in place and verified.
//! Downloads can also be fired by a time-based scheduler.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Range client, segment fetchers, task state machine and the engine
//! - [`scheduler`] - One-shot and recurring triggers
//! - [`store`] - Persistence gateway trait and its SQLite implementation
//! - [`db`] - Database connection and schema management
//! - [`manager`] - Submission surface combining engine and scheduler
//! - [`config`] - Engine tunables

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod manager;
pub mod scheduler;
pub mod store;
mod user_agent;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::{Database, DbError};
pub use download::{
    DownloadEngine, DownloadError, DownloadRequest, DownloadTask, EngineError, EngineStatistics,
    ErrorKind, HttpClient, ProgressEvent, TaskId, TaskState,
};
pub use manager::{Manager, ManagerError};
pub use scheduler::{FireOutcome, FireTarget, ScheduleEntry, ScheduleRule, Scheduler, SchedulerError};
pub use store::{SqliteStore, StoreError, TaskStore};
