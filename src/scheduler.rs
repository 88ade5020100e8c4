//! Time-based triggering of downloads.
//!
//! A [`Scheduler`] keeps one [`ScheduleEntry`] per task and a single timing
//! loop that sleeps until the earliest entry is due. Firing goes through the
//! [`FireTarget`] seam (the [`DownloadEngine`](crate::download::DownloadEngine)
//! in production), so the scheduler never competes for engine concurrency:
//! a saturated engine simply defers the run.
//!
//! Missed slots of a recurring rule collapse into one fire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::download::{EngineError, ErrorKind, TaskId, now_millis};
use crate::store::{StoreError, TaskStore};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Delay before a fire that errored is attempted again.
const FIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// When a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRule {
    /// A single run at an absolute time.
    Once {
        /// Unix milliseconds.
        at_ms: i64,
    },
    /// Runs at `first_ms + k * interval_ms`, optionally ending at `until_ms`.
    Recurring {
        first_ms: i64,
        interval_ms: i64,
        until_ms: Option<i64>,
    },
}

impl ScheduleRule {
    /// One run at `time`.
    #[must_use]
    pub fn at(time: SystemTime) -> Self {
        Self::Once {
            at_ms: system_time_millis(time),
        }
    }

    /// One run `delay` from now.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self::Once {
            at_ms: now_millis().saturating_add(duration_millis(delay)),
        }
    }

    /// Runs every `interval`, the first one `interval` from now.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        let interval_ms = duration_millis(interval);
        Self::Recurring {
            first_ms: now_millis().saturating_add(interval_ms),
            interval_ms,
            until_ms: None,
        }
    }

    /// Runs daily, starting at `first`.
    #[must_use]
    pub fn daily_from(first: SystemTime) -> Self {
        Self::Recurring {
            first_ms: system_time_millis(first),
            interval_ms: DAY_MS,
            until_ms: None,
        }
    }

    /// Runs weekly, starting at `first`.
    #[must_use]
    pub fn weekly_from(first: SystemTime) -> Self {
        Self::Recurring {
            first_ms: system_time_millis(first),
            interval_ms: WEEK_MS,
            until_ms: None,
        }
    }

    /// Ends a recurring rule at `end`; one-shot rules are returned unchanged.
    #[must_use]
    pub fn until(self, end: SystemTime) -> Self {
        match self {
            Self::Recurring {
                first_ms,
                interval_ms,
                ..
            } => Self::Recurring {
                first_ms,
                interval_ms,
                until_ms: Some(system_time_millis(end)),
            },
            once @ Self::Once { .. } => once,
        }
    }

    /// First fire time in unix milliseconds.
    #[must_use]
    pub fn first_fire_ms(&self) -> i64 {
        match *self {
            Self::Once { at_ms } => at_ms,
            Self::Recurring { first_ms, .. } => first_ms,
        }
    }

    /// First slot strictly after `now_ms`, or `None` once the rule is used up.
    ///
    /// Slots between the last fire and `now_ms` are skipped, so a late
    /// wake-up fires once rather than once per missed slot.
    #[must_use]
    pub fn next_fire_after(&self, now_ms: i64) -> Option<i64> {
        let Self::Recurring {
            first_ms,
            interval_ms,
            until_ms,
        } = *self
        else {
            return None;
        };
        if interval_ms <= 0 {
            return None;
        }
        let next = if now_ms < first_ms {
            first_ms
        } else {
            let slots = (now_ms - first_ms) / interval_ms + 1;
            first_ms.saturating_add(slots.saturating_mul(interval_ms))
        };
        match until_ms {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    /// Slots that passed unfired between `due_ms` and `now_ms`.
    #[must_use]
    pub fn missed_slots(&self, due_ms: i64, now_ms: i64) -> u64 {
        match *self {
            Self::Recurring { interval_ms, .. } if interval_ms > 0 && now_ms > due_ms => {
                u64::try_from((now_ms - due_ms) / interval_ms).unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Rejects rules that can never fire sensibly.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRule`] for a non-positive interval or
    /// an end before the first fire.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Self::Recurring {
            first_ms,
            interval_ms,
            until_ms,
        } = *self
        {
            if interval_ms <= 0 {
                return Err(SchedulerError::InvalidRule(
                    "interval must be positive".to_string(),
                ));
            }
            if until_ms.is_some_and(|end| end < first_ms) {
                return Err(SchedulerError::InvalidRule(
                    "end time is before the first fire".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A task's rule and its next due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub task_id: TaskId,
    pub rule: ScheduleRule,
    /// Unix milliseconds.
    pub next_fire_ms: i64,
}

impl ScheduleEntry {
    #[must_use]
    pub fn new(task_id: TaskId, rule: ScheduleRule) -> Self {
        Self {
            task_id,
            rule,
            next_fire_ms: rule.first_fire_ms(),
        }
    }

    #[must_use]
    pub fn next_fire_time(&self) -> SystemTime {
        millis_to_system_time(self.next_fire_ms)
    }
}

/// How a fired task was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// A concurrency slot was free.
    Started,
    /// Queued behind the concurrency limit.
    Deferred,
    /// Already queued or running; nothing changed.
    AlreadyActive,
}

/// Receiver of scheduler fires.
#[async_trait]
pub trait FireTarget: Send + Sync {
    /// Starts (or queues) a run of `task_id`.
    async fn fire(&self, task_id: TaskId) -> Result<FireOutcome, EngineError>;
}

/// Error type for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule rule: {0}")]
    InvalidRule(String),

    #[error("task {0} has no schedule")]
    NotScheduled(TaskId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct SchedulerInner {
    target: Arc<dyn FireTarget>,
    store: Arc<dyn TaskStore>,
    entries: Mutex<HashMap<TaskId, ScheduleEntry>>,
    changed: Notify,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on the timing loop; clones share it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.inner.entries().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Loads persisted entries and starts the timing loop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the entries cannot be loaded.
    #[instrument(skip_all)]
    pub async fn start(
        target: Arc<dyn FireTarget>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, SchedulerError> {
        let entries: HashMap<_, _> = store
            .load_schedules()
            .await?
            .into_iter()
            .map(|entry| (entry.task_id, entry))
            .collect();
        info!(entries = entries.len(), "scheduler starting");

        let inner = Arc::new(SchedulerInner {
            target,
            store,
            entries: Mutex::new(entries),
            changed: Notify::new(),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(None),
        });
        let handle = tokio::spawn(timing_loop(Arc::clone(&inner)));
        *inner.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(Self { inner })
    }

    /// Schedules `task_id`, replacing any existing rule.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRule`] or [`SchedulerError::Store`].
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn add(
        &self,
        task_id: TaskId,
        rule: ScheduleRule,
    ) -> Result<ScheduleEntry, SchedulerError> {
        rule.validate()?;
        let entry = ScheduleEntry::new(task_id, rule);
        self.inner.store.save_schedule(&entry).await?;
        self.inner.entries().insert(task_id, entry.clone());
        self.inner.changed.notify_one();
        info!(next_fire_ms = entry.next_fire_ms, "task scheduled");
        Ok(entry)
    }

    /// Replaces the rule of an already scheduled task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotScheduled`] if the task has no entry.
    pub async fn reschedule(
        &self,
        task_id: TaskId,
        rule: ScheduleRule,
    ) -> Result<ScheduleEntry, SchedulerError> {
        if !self.inner.entries().contains_key(&task_id) {
            return Err(SchedulerError::NotScheduled(task_id));
        }
        self.add(task_id, rule).await
    }

    /// Unschedules a task; true if it had an entry.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the durable entry cannot be deleted.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn remove(&self, task_id: TaskId) -> Result<bool, SchedulerError> {
        let existed = self.inner.entries().remove(&task_id).is_some();
        self.inner.store.delete_schedule(task_id).await?;
        self.inner.changed.notify_one();
        if existed {
            info!("task unscheduled");
        }
        Ok(existed)
    }

    /// All entries, soonest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<_> = self.inner.entries().values().cloned().collect();
        entries.sort_by_key(|entry| entry.next_fire_ms);
        entries
    }

    #[must_use]
    pub fn entry(&self, task_id: TaskId) -> Option<ScheduleEntry> {
        self.inner.entries().get(&task_id).cloned()
    }

    /// Earliest pending fire over all entries.
    #[must_use]
    pub fn next_fire_time(&self) -> Option<SystemTime> {
        self.inner
            .entries()
            .values()
            .map(|entry| entry.next_fire_ms)
            .min()
            .map(millis_to_system_time)
    }

    /// Stops the timing loop; entries stay persisted.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.changed.notify_one();
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn timing_loop(inner: Arc<SchedulerInner>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        let now = now_millis();
        let mut due: Vec<ScheduleEntry> = inner
            .entries()
            .values()
            .filter(|entry| entry.next_fire_ms <= now)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.next_fire_ms);
        for entry in due {
            fire_entry(&inner, entry, now).await;
        }

        let next = inner.entries().values().map(|e| e.next_fire_ms).min();
        match next {
            Some(at) => {
                let wait = u64::try_from(at.saturating_sub(now_millis())).unwrap_or(0);
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    () = inner.changed.notified() => {}
                }
            }
            None => inner.changed.notified().await,
        }
    }
    debug!("scheduler loop exited");
}

#[instrument(skip(inner, entry), fields(task_id = %entry.task_id))]
async fn fire_entry(inner: &SchedulerInner, entry: ScheduleEntry, now: i64) {
    let missed = entry.rule.missed_slots(entry.next_fire_ms, now);
    if missed > 0 {
        info!(missed, "collapsing missed slots into one fire");
    }

    match inner.target.fire(entry.task_id).await {
        Ok(FireOutcome::Started) => info!("scheduled download started"),
        Ok(FireOutcome::AlreadyActive) => debug!("task already active, fire skipped"),
        Ok(FireOutcome::Deferred) => warn!(
            kind = %ErrorKind::SchedulerMisfire,
            "engine saturated, scheduled run waits in the queue"
        ),
        Err(EngineError::TaskNotFound(_)) => {
            warn!("scheduled task no longer exists, dropping entry");
            settle(inner, &entry, None).await;
            return;
        }
        Err(error) => {
            let retry_at = now_millis().saturating_add(duration_millis(FIRE_RETRY_DELAY));
            warn!(
                kind = %ErrorKind::SchedulerMisfire,
                error = %error,
                retry_at_ms = retry_at,
                "scheduled fire failed, keeping entry"
            );
            settle(inner, &entry, Some(retry_at)).await;
            return;
        }
    }

    settle(inner, &entry, entry.rule.next_fire_after(now)).await;
}

/// Advances or drops a fired entry, unless it was changed meanwhile.
async fn settle(inner: &SchedulerInner, fired: &ScheduleEntry, next: Option<i64>) {
    let updated = {
        let mut entries = inner.entries();
        if entries.get(&fired.task_id) != Some(fired) {
            return;
        }
        match next {
            Some(next_fire_ms) => {
                let updated = ScheduleEntry {
                    next_fire_ms,
                    ..fired.clone()
                };
                entries.insert(fired.task_id, updated.clone());
                Some(updated)
            }
            None => {
                entries.remove(&fired.task_id);
                None
            }
        }
    };

    let persisted = match &updated {
        Some(entry) => {
            debug!(next_fire_ms = entry.next_fire_ms, "entry advanced");
            inner.store.save_schedule(entry).await
        }
        None => {
            debug!("entry finished");
            inner.store.delete_schedule(fired.task_id).await
        }
    };
    if let Err(error) = persisted {
        warn!(error = %error, "failed to persist schedule entry");
    }
}

fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn millis_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
