//! `SQLite` implementation of [`TaskStore`].

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, instrument};

use super::{StoreError, TaskStore};
use crate::db::Database;
use crate::download::{
    DownloadTask, ErrorKind, Segment, SegmentState, TaskFailure, TaskId, TaskState, Validator,
};
use crate::scheduler::{ScheduleEntry, ScheduleRule};

/// Task store backed by the `tasks`, `segments` and `schedules` tables.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn corrupt(task_id: &str, field: &'static str, value: impl ToString) -> StoreError {
    StoreError::Corrupt {
        task_id: task_id.to_string(),
        field,
        value: value.to_string(),
    }
}

fn to_u64(task_id: &str, field: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| corrupt(task_id, field, value))
}

fn to_u32(task_id: &str, field: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(task_id, field, value))
}

fn task_from_row(row: &SqliteRow) -> Result<DownloadTask, StoreError> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<TaskId>()
        .map_err(|_| corrupt(&id_str, "id", &id_str))?;

    let state_str: String = row.try_get("state")?;
    let state = state_str
        .parse::<TaskState>()
        .map_err(|_| corrupt(&id_str, "state", &state_str))?;

    let total_size = row
        .try_get::<Option<i64>, _>("total_size")?
        .map(|v| to_u64(&id_str, "total_size", v))
        .transpose()?;

    let kind: Option<String> = row.try_get("last_error_kind")?;
    let message: Option<String> = row.try_get("last_error_message")?;
    let last_error = match kind {
        Some(kind) => Some(TaskFailure {
            kind: kind
                .parse::<ErrorKind>()
                .map_err(|_| corrupt(&id_str, "last_error_kind", &kind))?,
            message: message.unwrap_or_default(),
        }),
        None => None,
    };

    let destination: String = row.try_get("destination")?;

    Ok(DownloadTask {
        id,
        url: row.try_get("url")?,
        destination: PathBuf::from(destination),
        total_size,
        supports_ranges: row.try_get("supports_ranges")?,
        validator: Validator {
            etag: row.try_get("etag")?,
            last_modified: row.try_get("last_modified")?,
        },
        segments: Vec::new(),
        state,
        retry_count: to_u32(&id_str, "retry_count", row.try_get("retry_count")?)?,
        max_retries: to_u32(&id_str, "max_retries", row.try_get("max_retries")?)?,
        checksum: row.try_get("checksum")?,
        scheduled: row.try_get("scheduled")?,
        last_error,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn segment_from_row(row: &SqliteRow) -> Result<(String, Segment), StoreError> {
    let task_id: String = row.try_get("task_id")?;
    let state_str: String = row.try_get("state")?;
    let state = state_str
        .parse::<SegmentState>()
        .map_err(|_| corrupt(&task_id, "segment state", &state_str))?;
    let length = row
        .try_get::<Option<i64>, _>("length")?
        .map(|v| to_u64(&task_id, "length", v))
        .transpose()?;

    let segment = Segment {
        index: to_u32(&task_id, "idx", row.try_get("idx")?)?,
        offset: to_u64(&task_id, "start_offset", row.try_get("start_offset")?)?,
        length,
        bytes_fetched: to_u64(&task_id, "bytes_fetched", row.try_get("bytes_fetched")?)?,
        state,
    };
    Ok((task_id, segment))
}

#[async_trait]
impl TaskStore for SqliteStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, state = %task.state))]
    async fn save_task_state(&self, task: &DownloadTask) -> Result<(), StoreError> {
        let id = task.id.to_string();
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO tasks (
                id, url, destination, state, total_size, supports_ranges, etag,
                last_modified, checksum, retry_count, max_retries, scheduled,
                last_error_kind, last_error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                url = excluded.url,
                destination = excluded.destination,
                state = excluded.state,
                total_size = excluded.total_size,
                supports_ranges = excluded.supports_ranges,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                checksum = excluded.checksum,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                scheduled = excluded.scheduled,
                last_error_kind = excluded.last_error_kind,
                last_error_message = excluded.last_error_message,
                updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&task.url)
        .bind(task.destination.to_string_lossy().into_owned())
        .bind(task.state.as_str())
        .bind(task.total_size.map(to_i64))
        .bind(task.supports_ranges)
        .bind(task.validator.etag.as_deref())
        .bind(task.validator.last_modified.as_deref())
        .bind(task.checksum.as_deref())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(task.scheduled)
        .bind(task.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(task.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM segments WHERE task_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        for segment in &task.segments {
            sqlx::query(
                r"INSERT INTO segments (task_id, idx, start_offset, length, bytes_fetched, state)
                VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(i64::from(segment.index))
            .bind(to_i64(segment.offset))
            .bind(segment.length.map(to_i64))
            .bind(to_i64(segment.bytes_fetched))
            .bind(segment.state.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_all_tasks(&self) -> Result<Vec<DownloadTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
            .fetch_all(self.db.pool())
            .await?;
        let mut tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let segment_rows = sqlx::query("SELECT * FROM segments ORDER BY task_id ASC, idx ASC")
            .fetch_all(self.db.pool())
            .await?;
        for row in &segment_rows {
            let (task_id, segment) = segment_from_row(row)?;
            if let Some(task) = tasks.iter_mut().find(|t| t.id.to_string() == task_id) {
                task.segments.push(segment);
            }
        }

        debug!(count = tasks.len(), "loaded tasks");
        Ok(tasks)
    }

    async fn save_segment_checkpoint(
        &self,
        task_id: TaskId,
        index: u32,
        bytes_fetched: u64,
    ) -> Result<(), StoreError> {
        let bytes = to_i64(bytes_fetched);
        let result = sqlx::query(
            r"UPDATE segments SET bytes_fetched = ?
            WHERE task_id = ? AND idx = ? AND bytes_fetched <= ?",
        )
        .bind(bytes)
        .bind(task_id.to_string())
        .bind(i64::from(index))
        .bind(bytes)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CheckpointRejected {
                task_id,
                index,
                bytes_fetched,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn delete_task(&self, task_id: TaskId) -> Result<(), StoreError> {
        let id = task_id.to_string();
        let mut tx = self.db.pool().begin().await?;
        for statement in [
            "DELETE FROM schedules WHERE task_id = ?",
            "DELETE FROM segments WHERE task_id = ?",
            "DELETE FROM tasks WHERE id = ?",
        ] {
            sqlx::query(statement).bind(&id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(task_id = %entry.task_id))]
    async fn save_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let rule = serde_json::to_string(&entry.rule)?;
        sqlx::query(
            r"INSERT INTO schedules (task_id, rule, next_fire_ms) VALUES (?, ?, ?)
            ON CONFLICT (task_id) DO UPDATE SET
                rule = excluded.rule,
                next_fire_ms = excluded.next_fire_ms",
        )
        .bind(entry.task_id.to_string())
        .bind(rule)
        .bind(entry.next_fire_ms)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let rows = sqlx::query("SELECT task_id, rule, next_fire_ms FROM schedules")
            .fetch_all(self.db.pool())
            .await?;

        rows.iter()
            .map(|row| {
                let id_str: String = row.try_get("task_id")?;
                let task_id = id_str
                    .parse::<TaskId>()
                    .map_err(|_| corrupt(&id_str, "schedule task_id", &id_str))?;
                let rule_json: String = row.try_get("rule")?;
                let rule: ScheduleRule = serde_json::from_str(&rule_json)?;
                Ok(ScheduleEntry {
                    task_id,
                    rule,
                    next_fire_ms: row.try_get("next_fire_ms")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn delete_schedule(&self, task_id: TaskId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM schedules WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new_in_memory().await.unwrap())
    }

    fn planned_task() -> DownloadTask {
        let mut task = DownloadTask::new(
            "https://example.com/big.iso",
            "/tmp/big.iso",
            Some("sha256:00".into()),
            3,
        );
        task.total_size = Some(20);
        task.supports_ranges = true;
        task.validator.etag = Some("\"v1\"".into());
        task.segments = vec![Segment::new(0, 0, Some(10)), Segment::new(1, 10, Some(10))];
        task
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = store().await;
        let task = planned_task();
        store.save_task_state(&task).await.unwrap();

        let loaded = store.load_all_tasks().await.unwrap();
        assert_eq!(loaded, vec![task]);
    }

    #[tokio::test]
    async fn test_save_task_state_replaces_segments() {
        let store = store().await;
        let mut task = planned_task();
        store.save_task_state(&task).await.unwrap();

        task.segments = vec![Segment::new(0, 0, Some(20))];
        task.transition(TaskState::Probing).unwrap();
        task.fail(TaskFailure {
            kind: ErrorKind::ResourceChanged,
            message: "etag changed".into(),
        })
        .unwrap();
        store.save_task_state(&task).await.unwrap();

        let loaded = store.load_all_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].segments.len(), 1);
        assert_eq!(loaded[0].state, TaskState::Failed);
        assert_eq!(
            loaded[0].last_error.as_ref().unwrap().kind,
            ErrorKind::ResourceChanged
        );
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let store = store().await;
        let task = planned_task();
        store.save_task_state(&task).await.unwrap();

        store.save_segment_checkpoint(task.id, 1, 6).await.unwrap();
        store.save_segment_checkpoint(task.id, 1, 6).await.unwrap();
        let regression = store.save_segment_checkpoint(task.id, 1, 3).await;
        assert!(matches!(
            regression,
            Err(StoreError::CheckpointRejected { index: 1, .. })
        ));

        let loaded = store.load_all_tasks().await.unwrap();
        assert_eq!(loaded[0].segments[1].bytes_fetched, 6);
        assert_eq!(loaded[0].bytes_downloaded(), 6);
    }

    #[tokio::test]
    async fn test_checkpoint_for_unknown_segment_is_rejected() {
        let store = store().await;
        let result = store.save_segment_checkpoint(TaskId::new(), 0, 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_task_removes_everything() {
        let store = store().await;
        let task = planned_task();
        store.save_task_state(&task).await.unwrap();
        store
            .save_schedule(&ScheduleEntry {
                task_id: task.id,
                rule: ScheduleRule::every(Duration::from_secs(60)),
                next_fire_ms: 1,
            })
            .await
            .unwrap();

        store.delete_task(task.id).await.unwrap();
        assert!(store.load_all_tasks().await.unwrap().is_empty());
        assert!(store.load_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_round_trip_and_upsert() {
        let store = store().await;
        let task = planned_task();
        store.save_task_state(&task).await.unwrap();

        let mut entry = ScheduleEntry {
            task_id: task.id,
            rule: ScheduleRule::every(Duration::from_secs(3600)),
            next_fire_ms: 1_000,
        };
        store.save_schedule(&entry).await.unwrap();
        entry.next_fire_ms = 2_000;
        store.save_schedule(&entry).await.unwrap();

        let loaded = store.load_schedules().await.unwrap();
        assert_eq!(loaded, vec![entry]);

        store.delete_schedule(task.id).await.unwrap();
        assert!(store.load_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let store = store().await;
        let task = planned_task();
        store.save_task_state(&task).await.unwrap();
        sqlx::query("UPDATE tasks SET retry_count = -1")
            .execute(store.db.pool())
            .await
            .unwrap();

        let err = store.load_all_tasks().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Corrupt {
                field: "retry_count",
                ..
            }
        ));
    }
}
