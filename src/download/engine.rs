//! Download engine: admission, per-task drivers and live tuning.
//!
//! The engine owns every known [`DownloadTask`]. Tasks wait in a FIFO
//! admission queue until one of `max_concurrent_downloads` slots frees; an
//! admitted task gets a driver (see `runner`) that probes the server, plans
//! segments, runs one fetcher per segment, merges and verifies.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use splitfetch_core::{Database, EngineConfig, SqliteStore};
//! use splitfetch_core::download::{DownloadEngine, DownloadRequest, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let store = Arc::new(SqliteStore::new(db));
//! let engine = DownloadEngine::start(EngineConfig::default(), HttpClient::new()?, store).await?;
//! let id = engine
//!     .submit(DownloadRequest::new("https://example.com/image.iso", "./downloads"))
//!     .await?;
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if event.task_id == id && event.state.is_terminal() {
//!         break;
//!     }
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod persistence;
mod registry;
mod runner;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info, instrument};

use super::bandwidth::BandwidthLimiter;
use super::client::{HttpClient, parse_http_url};
use super::constants::PROGRESS_CHANNEL_CAPACITY;
use super::fetcher::StopSignal;
use super::filename::resolve_destination;
use super::integrity::parse_checksum;
use super::progress::ProgressEvent;
use super::task::{DownloadTask, InvalidTransition, TaskId, TaskState};
use crate::config::EngineConfig;
use crate::scheduler::{FireOutcome, FireTarget, ScheduleRule};
use crate::store::{StoreError, TaskStore};
use persistence::{announce, persist_task, remove_part_file};
use registry::{Registry, RunControl};

/// Error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request was rejected before any task was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No task with this id is known.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The operation is not allowed in the task's current state.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A configuration value or live limit was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The engine no longer accepts work.
    #[error("engine is shut down")]
    ShutDown,
}

/// What to download and where.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    /// http(s) URL of the resource.
    pub url: String,
    /// Target file, or an existing directory to place a URL-derived name in.
    pub destination: PathBuf,
    /// Expected digest, `sha256:<hex>` or bare hex.
    pub checksum: Option<String>,
    /// Read by [`Manager::submit`](crate::Manager::submit); the engine
    /// itself ignores it.
    pub schedule: Option<ScheduleRule>,
}

impl DownloadRequest {
    /// Creates an unscheduled request without checksum.
    #[must_use]
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            checksum: None,
            schedule: None,
        }
    }

    /// Sets the expected digest.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Sets the schedule rule.
    #[must_use]
    pub fn with_schedule(mut self, rule: ScheduleRule) -> Self {
        self.schedule = Some(rule);
        self
    }
}

/// Point-in-time counters over all known tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatistics {
    /// Tasks known to the engine.
    pub total: usize,
    /// Tasks holding a concurrency slot.
    pub active: usize,
    /// Tasks waiting for admission.
    pub queued: usize,
    /// Task count per state; absent states have none.
    pub by_state: HashMap<TaskState, usize>,
    /// Bytes received over all tasks.
    pub bytes_downloaded: u64,
}

impl EngineStatistics {
    /// Number of tasks in `state`.
    #[must_use]
    pub fn count(&self, state: TaskState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    client: HttpClient,
    store: Arc<dyn TaskStore>,
    registry: Mutex<Registry>,
    dispatch: Notify,
    thread_limit: AtomicUsize,
    bandwidth: Arc<BandwidthLimiter>,
    events: broadcast::Sender<ProgressEvent>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on a running download engine; clones share the same engine.
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Builds the engine, recovers persisted tasks and starts admission.
    ///
    /// Every task that is neither finished, paused nor waiting for the
    /// scheduler is queued again. Tasks interrupted mid-run re-probe and
    /// continue from their last checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for a bad `config` and
    /// [`EngineError::Store`] if the tasks cannot be loaded.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        client: HttpClient,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let tasks = store.load_all_tasks().await?;

        let mut registry = Registry::new(config.max_concurrent_downloads);
        let mut recovered = 0usize;
        for task in tasks {
            let id = task.id;
            let recover = !task.state.is_terminal()
                && task.state != TaskState::Paused
                && (!task.scheduled || task.state.is_running());
            registry.insert(task);
            if recover {
                registry.enqueue(id);
                recovered += 1;
            }
        }
        info!(
            tasks = registry.slots.len(),
            recovered,
            max_concurrent = config.max_concurrent_downloads,
            threads_per_task = config.max_threads_per_download,
            "download engine starting"
        );

        let (events, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let inner = Arc::new(EngineInner {
            thread_limit: AtomicUsize::new(config.max_threads_per_download),
            bandwidth: Arc::new(BandwidthLimiter::new(config.bandwidth_limit)),
            config,
            client,
            store,
            registry: Mutex::new(registry),
            dispatch: Notify::new(),
            events,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Ok(Self { inner })
    }

    /// Validates `request` and queues a new task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] for a non-http(s) or malformed
    /// URL, a missing or read-only destination directory, a malformed
    /// checksum, or a destination claimed by another unfinished task.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn submit(&self, request: DownloadRequest) -> Result<TaskId, EngineError> {
        self.add(&request, false).await
    }

    /// Like [`submit`](Self::submit), but the task waits for a scheduler
    /// trigger instead of being queued.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn register(&self, request: DownloadRequest) -> Result<TaskId, EngineError> {
        self.add(&request, true).await
    }

    async fn add(&self, request: &DownloadRequest, scheduled: bool) -> Result<TaskId, EngineError> {
        let mut task = self.prepare_task(request)?;
        task.scheduled = scheduled;
        let id = task.id;

        {
            let mut registry = self.inner.lock();
            if registry.shutting_down {
                return Err(EngineError::ShutDown);
            }
            if let Some(owner) = registry.destination_owner(&task.destination) {
                return Err(EngineError::InvalidRequest(format!(
                    "destination {} is already used by task {owner}",
                    task.destination.display()
                )));
            }
            registry.insert(task.clone());
        }

        if let Err(error) = persist_task(&self.inner, &task).await {
            self.inner.lock().slots.remove(&id);
            return Err(error.into());
        }
        if !scheduled {
            self.inner.lock().enqueue(id);
            self.inner.dispatch.notify_one();
        }
        announce(&self.inner, &task, 0.0);
        info!(
            task_id = %id,
            destination = %task.destination.display(),
            scheduled,
            "task added"
        );
        Ok(id)
    }

    fn prepare_task(&self, request: &DownloadRequest) -> Result<DownloadTask, EngineError> {
        let url = parse_http_url(&request.url).map_err(|_| {
            EngineError::InvalidRequest(format!("unsupported or malformed URL: {}", request.url))
        })?;
        let organize = self.inner.config.organize_by_category;
        let destination = resolve_destination(&url, &request.destination, organize);

        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if organize && request.destination.is_dir() && directory != request.destination {
            std::fs::create_dir_all(&directory).map_err(|e| {
                EngineError::InvalidRequest(format!(
                    "cannot create category directory {}: {e}",
                    directory.display()
                ))
            })?;
        }
        let metadata = std::fs::metadata(&directory).map_err(|e| {
            EngineError::InvalidRequest(format!(
                "destination directory {} is not accessible: {e}",
                directory.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(EngineError::InvalidRequest(format!(
                "{} is not a directory",
                directory.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(EngineError::InvalidRequest(format!(
                "destination directory {} is not writable",
                directory.display()
            )));
        }

        let checksum = match request.checksum.as_deref() {
            None => None,
            Some(raw) => Some(parse_checksum(raw).ok_or_else(|| {
                EngineError::InvalidRequest(format!("malformed checksum: {raw}"))
            })?),
        };

        Ok(DownloadTask::new(
            url.as_str(),
            destination,
            checksum,
            self.inner.config.task_max_retries,
        ))
    }

    /// Pauses a task, waiting for its fetchers to stop.
    ///
    /// Pausing a paused task does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or, for finished tasks,
    /// [`EngineError::InvalidTransition`].
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn pause(&self, id: TaskId) -> Result<(), EngineError> {
        match self.stop_or_settle(id, StopSignal::Pause, TaskState::Paused)? {
            Settle::Wait(mut finished) => {
                let _ = finished.wait_for(|done| *done).await;
            }
            Settle::Persist(task) => {
                persist_task(&self.inner, &task).await?;
                announce(&self.inner, &task, 0.0);
            }
            Settle::Nothing => debug!("task already paused"),
        }
        Ok(())
    }

    /// Cancels a task and deletes its part-file.
    ///
    /// Cancelling a canceled task does nothing. A task that finished before
    /// the cancel reached it is canceled afterwards if its state allows.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or, for completed tasks,
    /// [`EngineError::InvalidTransition`].
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        loop {
            match self.stop_or_settle(id, StopSignal::Cancel, TaskState::Canceled)? {
                Settle::Wait(mut finished) => {
                    let _ = finished.wait_for(|done| *done).await;
                }
                Settle::Persist(task) => {
                    remove_part_file(&task.part_path()).await;
                    persist_task(&self.inner, &task).await?;
                    announce(&self.inner, &task, 0.0);
                    return Ok(());
                }
                Settle::Nothing => return Ok(()),
            }
        }
    }

    /// Signals a running task, or moves an idle one to `target` directly.
    fn stop_or_settle(
        &self,
        id: TaskId,
        signal: StopSignal,
        target: TaskState,
    ) -> Result<Settle, EngineError> {
        let mut registry = self.inner.lock();
        let slot = registry
            .slots
            .get_mut(&id)
            .ok_or(EngineError::TaskNotFound(id))?;

        if let Some(control) = &slot.control {
            control.request(signal);
            return Ok(Settle::Wait(control.finished.clone()));
        }
        if slot.task.state == target {
            // A resumed task still waiting for a slot is taken off the queue.
            if slot.queued {
                registry.dequeue(id);
            }
            return Ok(Settle::Nothing);
        }
        slot.task.transition(target)?;
        slot.task.park_segments();
        let task = slot.task.clone();
        registry.dequeue(id);
        Ok(Settle::Persist(task))
    }

    /// Queues a paused or pending task again.
    ///
    /// Resuming a queued or running task does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] for finished tasks; use
    /// [`retry`](Self::retry) for those.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn resume(&self, id: TaskId) -> Result<(), EngineError> {
        let queued = {
            let mut registry = self.inner.lock();
            let slot = registry
                .slots
                .get(&id)
                .ok_or(EngineError::TaskNotFound(id))?;
            if slot.is_busy() {
                false
            } else if slot.task.state.is_terminal() {
                return Err(InvalidTransition {
                    from: slot.task.state,
                    to: TaskState::Probing,
                }
                .into());
            } else {
                registry.enqueue(id)
            }
        };
        if queued {
            debug!("task queued for resume");
            self.inner.dispatch.notify_one();
        }
        Ok(())
    }

    /// Reruns a failed or canceled task from a clean slate.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] for any other state.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn retry(&self, id: TaskId) -> Result<(), EngineError> {
        let task = {
            let mut registry = self.inner.lock();
            let slot = registry
                .slots
                .get_mut(&id)
                .ok_or(EngineError::TaskNotFound(id))?;
            if slot.is_busy() || !matches!(slot.task.state, TaskState::Failed | TaskState::Canceled)
            {
                return Err(InvalidTransition {
                    from: slot.task.state,
                    to: TaskState::Pending,
                }
                .into());
            }
            slot.task.reset_for_rerun()?;
            slot.task.clone()
        };

        persist_task(&self.inner, &task).await?;
        announce(&self.inner, &task, 0.0);
        self.inner.lock().enqueue(id);
        self.inner.dispatch.notify_one();
        info!("task queued for retry");
        Ok(())
    }

    /// Cancels a running task, then forgets it and its durable record.
    ///
    /// A completed file stays on disk; part-files are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or [`EngineError::Store`].
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn remove(&self, id: TaskId) -> Result<(), EngineError> {
        let task = loop {
            let mut waiting = {
                let mut registry = self.inner.lock();
                let slot = registry
                    .slots
                    .get(&id)
                    .ok_or(EngineError::TaskNotFound(id))?;
                match &slot.control {
                    Some(control) => {
                        control.request(StopSignal::Cancel);
                        control.finished.clone()
                    }
                    None => {
                        registry.dequeue(id);
                        match registry.slots.remove(&id) {
                            Some(slot) => break slot.task,
                            None => return Err(EngineError::TaskNotFound(id)),
                        }
                    }
                }
            };
            let _ = waiting.wait_for(|done| *done).await;
        };

        self.inner.store.delete_task(id).await?;
        if task.state != TaskState::Completed {
            remove_part_file(&task.part_path()).await;
        }
        info!("task removed");
        Ok(())
    }

    /// Scheduler entry point: queues the task, rerunning finished ones.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] or [`EngineError::Store`].
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn trigger(&self, id: TaskId) -> Result<FireOutcome, EngineError> {
        let changed = {
            let mut registry = self.inner.lock();
            let slot = registry
                .slots
                .get_mut(&id)
                .ok_or(EngineError::TaskNotFound(id))?;
            if slot.is_busy() {
                return Ok(FireOutcome::AlreadyActive);
            }
            let reset = slot.task.state.is_terminal();
            if reset {
                slot.task.reset_for_rerun()?;
            }
            // Once fired, the run belongs to the admission queue and survives a restart.
            let fired = std::mem::replace(&mut slot.task.scheduled, false);
            if fired && !reset {
                slot.task.touch();
            }
            (reset || fired).then(|| slot.task.clone())
        };

        // Durable before queued, so no driver write can be overtaken.
        if let Some(task) = changed {
            persist_task(&self.inner, &task).await?;
            announce(&self.inner, &task, 0.0);
        }

        let outcome = {
            let mut registry = self.inner.lock();
            if !registry.enqueue(id) {
                return Ok(FireOutcome::AlreadyActive);
            }
            if !registry.shutting_down && registry.has_free_slot() {
                FireOutcome::Started
            } else {
                FireOutcome::Deferred
            }
        };
        self.inner.dispatch.notify_one();
        debug!(outcome = ?outcome, "task triggered");
        Ok(outcome)
    }

    /// Snapshot of one task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] for unknown ids.
    pub fn task(&self, id: TaskId) -> Result<DownloadTask, EngineError> {
        self.inner
            .lock()
            .slots
            .get(&id)
            .map(|slot| slot.task.clone())
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Snapshots of all tasks, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self
            .inner
            .lock()
            .slots
            .values()
            .map(|slot| slot.task.clone())
            .collect();
        tasks.sort_by_key(|task| (task.created_at, task.id.to_string()));
        tasks
    }

    /// Counts by state, plus active, queued and received bytes.
    #[must_use]
    pub fn statistics(&self) -> EngineStatistics {
        self.inner.lock().statistics()
    }

    /// Progress feed; slow receivers skip events rather than block.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Configuration the engine was started with; live limits are not reflected.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Changes how many tasks may download at once.
    ///
    /// Running tasks above a lowered limit finish; no new ones are admitted
    /// until the count drops below it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for zero.
    #[instrument(skip(self))]
    pub fn set_global_concurrency_limit(&self, limit: usize) -> Result<(), EngineError> {
        if limit == 0 {
            return Err(EngineError::InvalidConfig(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        self.inner.lock().max_active = limit;
        self.inner.dispatch.notify_one();
        info!(limit, "global concurrency limit changed");
        Ok(())
    }

    /// Changes the fetcher count used for tasks planned from now on.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for zero.
    #[instrument(skip(self))]
    pub fn set_per_task_thread_limit(&self, limit: usize) -> Result<(), EngineError> {
        if limit == 0 {
            return Err(EngineError::InvalidConfig(
                "thread limit must be at least 1".to_string(),
            ));
        }
        self.inner.thread_limit.store(limit, Ordering::Relaxed);
        info!(limit, "per-task thread limit changed");
        Ok(())
    }

    /// Changes the aggregate bandwidth limit; `None` or zero is unlimited.
    #[instrument(skip(self))]
    pub async fn set_bandwidth_limit(&self, bytes_per_second: Option<u64>) {
        self.inner.bandwidth.set_rate(bytes_per_second).await;
        info!(limit = ?bytes_per_second, "bandwidth limit changed");
    }

    /// Current aggregate bandwidth limit.
    pub async fn bandwidth_limit(&self) -> Option<u64> {
        self.inner.bandwidth.rate().await
    }

    /// Stops admission and every running task, then waits for them.
    ///
    /// Interrupted tasks keep their state and Paused segments, so the next
    /// [`start`](Self::start) resumes them.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let running: Vec<_> = {
            let mut registry = self.inner.lock();
            registry.shutting_down = true;
            registry.clear_queue();
            registry
                .slots
                .values()
                .filter_map(|slot| slot.control.as_ref())
                .map(|control| {
                    control.request(StopSignal::Shutdown);
                    control.finished.clone()
                })
                .collect()
        };
        self.inner.dispatch.notify_one();

        info!(running = running.len(), "shutting down download engine");
        for mut finished in running {
            let _ = finished.wait_for(|done| *done).await;
        }
        info!("download engine stopped");
    }
}

enum Settle {
    Wait(watch::Receiver<bool>),
    Persist(DownloadTask),
    Nothing,
}

#[async_trait]
impl FireTarget for DownloadEngine {
    async fn fire(&self, task_id: TaskId) -> Result<FireOutcome, EngineError> {
        self.trigger(task_id).await
    }
}

async fn dispatch_loop(inner: Arc<EngineInner>) {
    loop {
        admit_ready(&inner);
        inner.dispatch.notified().await;
        if inner.lock().shutting_down {
            debug!("admission dispatcher stopped");
            break;
        }
    }
}

/// Starts a driver for every queued task that fits under the limit.
fn admit_ready(inner: &Arc<EngineInner>) {
    let mut registry = inner.lock();
    while let Some(id) = registry.next_admission() {
        let Some(slot) = registry.slots.get_mut(&id) else {
            continue;
        };
        let (stop, stop_rx) = watch::channel(StopSignal::Run);
        let (finished_tx, finished) = watch::channel(false);
        slot.control = Some(RunControl { stop, finished });
        let task = slot.task.clone();
        registry.active += 1;
        debug!(task_id = %id, active = registry.active, "task admitted");
        tokio::spawn(runner::drive(Arc::clone(inner), task, stop_rx, finished_tx));
    }
    if registry.queue_len() > 0 {
        debug!(queued = registry.queue_len(), "tasks waiting for a free slot");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    async fn engine() -> (DownloadEngine, TempDir) {
        let db = Database::new_in_memory().await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::new(db));
        let engine = DownloadEngine::start(EngineConfig::default(), HttpClient::new().unwrap(), store)
            .await
            .unwrap();
        (engine, TempDir::new().unwrap())
    }

    #[tokio::test]
    async fn test_submit_rejects_non_http_url() {
        let (engine, dir) = engine().await;
        let result = engine
            .submit(DownloadRequest::new("ftp://example.com/a.bin", dir.path()))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_directory() {
        let (engine, dir) = engine().await;
        let result = engine
            .submit(DownloadRequest::new(
                "https://example.com/a.bin",
                dir.path().join("missing").join("a.bin"),
            ))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_checksum() {
        let (engine, dir) = engine().await;
        let request = DownloadRequest::new("https://example.com/a.bin", dir.path())
            .with_checksum("md5:abc");
        assert!(matches!(
            engine.submit(request).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_register_keeps_task_pending_and_scheduled() {
        let (engine, dir) = engine().await;
        let id = engine
            .register(DownloadRequest::new("https://example.com/a.bin", dir.path()))
            .await
            .unwrap();

        let task = engine.task(id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.scheduled);
        assert_eq!(task.destination, dir.path().join("a.bin"));
        assert_eq!(engine.statistics().queued, 0);
    }

    #[tokio::test]
    async fn test_duplicate_destination_is_rejected() {
        let (engine, dir) = engine().await;
        engine
            .register(DownloadRequest::new("https://example.com/a.bin", dir.path()))
            .await
            .unwrap();
        let second = engine
            .register(DownloadRequest::new("https://mirror.example.com/a.bin", dir.path()))
            .await;
        assert!(matches!(second, Err(EngineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_pause_and_cancel_idle_task_are_idempotent() {
        let (engine, dir) = engine().await;
        let id = engine
            .register(DownloadRequest::new("https://example.com/a.bin", dir.path()))
            .await
            .unwrap();

        engine.pause(id).await.unwrap();
        engine.pause(id).await.unwrap();
        assert_eq!(engine.task(id).unwrap().state, TaskState::Paused);

        engine.cancel(id).await.unwrap();
        engine.cancel(id).await.unwrap();
        assert_eq!(engine.task(id).unwrap().state, TaskState::Canceled);

        let resumed = engine.resume(id).await;
        assert!(matches!(resumed, Err(EngineError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_unknown_task_is_reported() {
        let (engine, _dir) = engine().await;
        let id = TaskId::new();
        assert!(matches!(engine.pause(id).await, Err(EngineError::TaskNotFound(_))));
        assert!(matches!(engine.task(id), Err(EngineError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_zero_limits_are_rejected() {
        let (engine, _dir) = engine().await;
        assert!(engine.set_global_concurrency_limit(0).is_err());
        assert!(engine.set_per_task_thread_limit(0).is_err());
        engine.set_global_concurrency_limit(5).unwrap();
        engine.set_bandwidth_limit(Some(1024)).await;
        assert_eq!(engine.bandwidth_limit().await, Some(1024));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let (engine, dir) = engine().await;
        engine.shutdown().await;
        let result = engine
            .submit(DownloadRequest::new("https://example.com/a.bin", dir.path()))
            .await;
        assert!(matches!(result, Err(EngineError::ShutDown)));
    }
}
