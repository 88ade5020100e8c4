//! Submission surface over the engine and the scheduler.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::download::{
    DownloadEngine, DownloadRequest, DownloadTask, EngineError, EngineStatistics, HttpClient,
    ProgressEvent, TaskId,
};
use crate::scheduler::{ScheduleEntry, ScheduleRule, Scheduler, SchedulerError};
use crate::store::TaskStore;

/// Error type for [`Manager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Owns a [`DownloadEngine`] and the [`Scheduler`] that fires into it.
#[derive(Debug, Clone)]
pub struct Manager {
    engine: DownloadEngine,
    scheduler: Scheduler,
}

impl Manager {
    /// Starts the engine, then a scheduler targeting it, over one store.
    ///
    /// # Errors
    ///
    /// Returns the first startup error of either component.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        client: HttpClient,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, ManagerError> {
        let engine = DownloadEngine::start(config, client, Arc::clone(&store)).await?;
        let scheduler = Scheduler::start(Arc::new(engine.clone()), store).await?;
        Ok(Self { engine, scheduler })
    }

    /// Adds a download: queued now, or registered and scheduled when the
    /// request carries a rule.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] (wrapped) for a bad request or
    /// rule, and store errors from either component.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn submit(&self, request: DownloadRequest) -> Result<TaskId, ManagerError> {
        let Some(rule) = request.schedule else {
            return Ok(self.engine.submit(request).await?);
        };
        if let Err(SchedulerError::InvalidRule(reason)) = rule.validate() {
            return Err(EngineError::InvalidRequest(reason).into());
        }

        let id = self.engine.register(request).await?;
        if let Err(error) = self.scheduler.add(id, rule).await {
            warn!(task_id = %id, error = %error, "schedule not stored, dropping task");
            if let Err(cleanup) = self.engine.remove(id).await {
                warn!(task_id = %id, error = %cleanup, "failed to drop unscheduled task");
            }
            return Err(error.into());
        }
        info!(task_id = %id, "scheduled download registered");
        Ok(id)
    }

    /// Attaches or replaces the schedule of an existing task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] (wrapped) for unknown tasks.
    pub async fn schedule(
        &self,
        id: TaskId,
        rule: ScheduleRule,
    ) -> Result<ScheduleEntry, ManagerError> {
        self.engine.task(id)?;
        Ok(self.scheduler.add(id, rule).await?)
    }

    /// Drops a task's schedule; true if it had one.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn unschedule(&self, id: TaskId) -> Result<bool, ManagerError> {
        Ok(self.scheduler.remove(id).await?)
    }

    /// # Errors
    ///
    /// See [`DownloadEngine::pause`].
    pub async fn pause(&self, id: TaskId) -> Result<(), ManagerError> {
        Ok(self.engine.pause(id).await?)
    }

    /// # Errors
    ///
    /// See [`DownloadEngine::resume`].
    pub async fn resume(&self, id: TaskId) -> Result<(), ManagerError> {
        Ok(self.engine.resume(id).await?)
    }

    /// Cancels the current run; a schedule stays in place.
    ///
    /// # Errors
    ///
    /// See [`DownloadEngine::cancel`].
    pub async fn cancel(&self, id: TaskId) -> Result<(), ManagerError> {
        Ok(self.engine.cancel(id).await?)
    }

    /// # Errors
    ///
    /// See [`DownloadEngine::retry`].
    pub async fn retry(&self, id: TaskId) -> Result<(), ManagerError> {
        Ok(self.engine.retry(id).await?)
    }

    /// Unschedules, then removes the task.
    ///
    /// # Errors
    ///
    /// See [`DownloadEngine::remove`].
    pub async fn remove(&self, id: TaskId) -> Result<(), ManagerError> {
        self.scheduler.remove(id).await?;
        Ok(self.engine.remove(id).await?)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::TaskNotFound`] (wrapped) for unknown tasks.
    pub fn task(&self, id: TaskId) -> Result<DownloadTask, ManagerError> {
        Ok(self.engine.task(id)?)
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.engine.tasks()
    }

    #[must_use]
    pub fn statistics(&self) -> EngineStatistics {
        self.engine.statistics()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.engine.subscribe()
    }

    #[must_use]
    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stops the scheduler first so nothing fires into a stopping engine.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.engine.shutdown().await;
    }
}
