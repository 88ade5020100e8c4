//! Persistence gateway for task state, segment checkpoints and schedules.
//!
//! The engine and scheduler depend only on the [`TaskStore`] trait; the
//! durable copy it holds is the source of truth across restarts.
//! [`SqliteStore`] is the bundled implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::download::{DownloadTask, TaskId};
use crate::scheduler::ScheduleEntry;

/// Errors raised by a [`TaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed the operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schedule rule could not be encoded or decoded.
    #[error("schedule rule encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row holds a value the model cannot represent.
    #[error("corrupt {field} for task {task_id}: {value}")]
    Corrupt {
        /// Task the row belongs to.
        task_id: String,
        /// Column that failed to decode.
        field: &'static str,
        /// Offending raw value.
        value: String,
    },

    /// A checkpoint would move a segment backwards, or the segment is unknown.
    #[error("checkpoint rejected for task {task_id} segment {index} at {bytes_fetched} bytes")]
    CheckpointRejected {
        /// Task the segment belongs to.
        task_id: TaskId,
        /// Segment index.
        index: u32,
        /// Refused byte count.
        bytes_fetched: u64,
    },
}

impl StoreError {
    /// Returns true when SQLite reported the database busy or locked.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        let Self::Database(sqlx::Error::Database(database_error)) = self else {
            return false;
        };
        matches!(
            database_error.code().as_deref(),
            Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
        ) || database_error
            .message()
            .to_ascii_lowercase()
            .contains("database is locked")
    }
}

/// Durable storage contract used by the engine and the scheduler.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upserts a task together with its full segment plan.
    async fn save_task_state(&self, task: &DownloadTask) -> Result<(), StoreError>;

    /// Loads every stored task with its segments, oldest first.
    async fn load_all_tasks(&self) -> Result<Vec<DownloadTask>, StoreError>;

    /// Records durable progress of one segment.
    ///
    /// Implementations must refuse a value lower than the stored one.
    async fn save_segment_checkpoint(
        &self,
        task_id: TaskId,
        index: u32,
        bytes_fetched: u64,
    ) -> Result<(), StoreError>;

    /// Deletes a task, its segments and its schedule.
    async fn delete_task(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Upserts a schedule entry.
    async fn save_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    /// Loads every stored schedule entry.
    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    /// Deletes the schedule entry of a task, if any.
    async fn delete_schedule(&self, task_id: TaskId) -> Result<(), StoreError>;
}
