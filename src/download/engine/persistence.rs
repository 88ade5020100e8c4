use std::path::Path;

use tracing::{debug, warn};

use super::super::progress::ProgressEvent;
use super::super::task::DownloadTask;
use super::EngineInner;
use crate::store::StoreError;

/// Writes the durable copy of `task`.
pub(super) async fn persist_task(
    inner: &EngineInner,
    task: &DownloadTask,
) -> Result<(), StoreError> {
    inner.store.save_task_state(task).await.inspect_err(|error| {
        warn!(
            task_id = %task.id,
            state = %task.state,
            error = %error,
            "failed to persist task state"
        );
    })
}

/// Refreshes the registry snapshot and broadcasts a progress event.
pub(super) fn announce(inner: &EngineInner, task: &DownloadTask, speed_bytes_per_sec: f64) {
    if let Some(slot) = inner.lock().slots.get_mut(&task.id) {
        slot.task = task.clone();
    }
    // No receivers is not an error.
    let _ = inner
        .events
        .send(ProgressEvent::from_task(task, speed_bytes_per_sec));
}

/// Persists, then announces; persistence failures are returned after announcing.
pub(super) async fn publish(
    inner: &EngineInner,
    task: &DownloadTask,
    speed_bytes_per_sec: f64,
) -> Result<(), StoreError> {
    let persisted = persist_task(inner, task).await;
    announce(inner, task, speed_bytes_per_sec);
    persisted
}

/// Deletes a part-file; a missing file is fine.
pub(super) async fn remove_part_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed part-file"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            path = %path.display(),
            error = %error,
            "failed to remove part-file"
        ),
    }
}
