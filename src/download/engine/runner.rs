//! Per-task driver: probe, plan, fetch, merge, verify.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::super::client::ProbeResult;
use super::super::error::{DownloadError, ErrorKind};
use super::super::fetcher::{FetchOutcome, SegmentFetcher, StopSignal, stop_requested};
use super::super::integrity::verify_file;
use super::super::progress::SpeedMeter;
use super::super::retry::{FailureType, RetryDecision, classify_error};
use super::super::segment::{SegmentState, is_contiguous, plan_segments};
use super::super::storage::ensure_free_space;
use super::super::task::{DownloadTask, TaskFailure, TaskState};
use super::EngineInner;
use super::persistence::{announce, publish, remove_part_file};

enum Attempt {
    Completed,
    Stopped(StopSignal),
    Failed(DownloadError),
}

enum Transfer {
    Finished,
    Stopped(StopSignal),
    Failed(DownloadError),
}

enum TransferEvent {
    Joined(Option<Result<FetchOutcome, JoinError>>),
    Tick,
    Stop,
}

/// Runs one admitted task to a resting state, then releases its slot.
pub(super) async fn drive(
    inner: Arc<EngineInner>,
    task: DownloadTask,
    stop: watch::Receiver<StopSignal>,
    finished: watch::Sender<bool>,
) {
    let id = task.id;
    let mut driver = Driver {
        inner: &inner,
        task,
        stop,
        speed: 0.0,
    };
    driver.run().await;
    let task = driver.task;

    {
        let mut registry = inner.lock();
        registry.active = registry.active.saturating_sub(1);
        if let Some(slot) = registry.slots.get_mut(&id) {
            slot.task = task;
            slot.control = None;
        }
    }
    inner.dispatch.notify_one();
    let _ = finished.send(true);
}

struct Driver<'a> {
    inner: &'a EngineInner,
    task: DownloadTask,
    stop: watch::Receiver<StopSignal>,
    speed: f64,
}

impl Driver<'_> {
    #[instrument(skip_all, fields(task_id = %self.task.id, url = %self.task.url))]
    async fn run(&mut self) {
        if let Err(error) = self.task.transition(TaskState::Probing) {
            error!(error = %error, "task cannot start");
            return;
        }
        self.task.park_segments();
        if let Err(error) = self.publish().await {
            self.fail(error).await;
            return;
        }
        info!("task started");

        loop {
            let error = match self.attempt().await {
                Attempt::Completed => {
                    info!(bytes = self.task.bytes_downloaded(), "download completed");
                    return;
                }
                Attempt::Stopped(signal) => {
                    self.settle_stop(signal).await;
                    return;
                }
                Attempt::Failed(error) => error,
            };

            if classify_error(&error) == FailureType::Permanent
                || self.task.retry_count >= self.task.max_retries
            {
                self.fail(error).await;
                return;
            }
            self.task.retry_count += 1;

            let delay = match self
                .inner
                .config
                .task_retry_policy()
                .should_retry(FailureType::Transient, self.task.retry_count)
            {
                RetryDecision::Retry { delay, .. } => delay,
                RetryDecision::DoNotRetry { .. } => Duration::ZERO,
            };
            warn!(
                error = %error,
                kind = %error.kind(),
                retry = self.task.retry_count,
                max_retries = self.task.max_retries,
                delay_ms = delay.as_millis(),
                "task attempt failed, re-probing"
            );

            self.task.last_error = Some(TaskFailure::from(&error));
            self.task.park_segments();
            if self.task.state == TaskState::Probing {
                self.task.touch();
            } else if let Err(transition) = self.task.transition(TaskState::Probing) {
                error!(error = %transition, "cannot re-probe");
                self.fail(error).await;
                return;
            }
            if let Err(error) = self.publish().await {
                self.fail(error).await;
                return;
            }

            let stopped = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = stop_requested(&mut self.stop) => true,
            };
            if stopped {
                let signal = self.signal();
                self.settle_stop(signal).await;
                return;
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let probe = tokio::select! {
            result = self.inner.client.probe(&self.task.url) => Some(result),
            () = stop_requested(&mut self.stop) => None,
        };
        let probe = match probe {
            None => return Attempt::Stopped(self.signal()),
            Some(Err(error)) => return Attempt::Failed(error),
            Some(Ok(probe)) => probe,
        };
        if !probe.supports_ranges {
            info!(
                kind = %ErrorKind::RangeUnsupported,
                total_size = ?probe.total_size,
                "server does not support ranges, using a single stream"
            );
        }

        if let Err(error) = self.prepare_plan(&probe).await {
            return Attempt::Failed(error);
        }
        if let Err(error) = self.enter(TaskState::Downloading).await {
            return Attempt::Failed(error);
        }

        match self.transfer().await {
            Transfer::Finished => {}
            Transfer::Stopped(signal) => return Attempt::Stopped(signal),
            Transfer::Failed(error) => return Attempt::Failed(error),
        }

        // Past this point stop signals are ignored; merging is short.
        if let Err(error) = self.enter(TaskState::Merging).await {
            return Attempt::Failed(error);
        }
        if let Err(error) = self.merge().await {
            return Attempt::Failed(error);
        }
        if let Err(error) = self.enter(TaskState::Verifying).await {
            return Attempt::Failed(error);
        }
        if let Err(error) = verify_file(
            &self.task.destination,
            self.task.total_size,
            self.task.checksum.as_deref(),
        )
        .await
        {
            return Attempt::Failed(error);
        }

        self.task.last_error = None;
        self.speed = 0.0;
        if let Err(error) = self.enter(TaskState::Completed).await {
            error!(error = %error, "completed download could not be persisted");
        }
        Attempt::Completed
    }

    /// Keeps the checkpointed plan when the resource is unchanged, otherwise re-plans.
    async fn prepare_plan(&mut self, probe: &ProbeResult) -> Result<(), DownloadError> {
        let part = self.task.part_path();
        if self.plan_is_reusable(probe, &part).await {
            self.ensure_space(&part)?;
            debug!(
                bytes = self.task.bytes_downloaded(),
                segments = self.task.segments.len(),
                "resuming from checkpoints"
            );
            return Ok(());
        }
        if !self.task.segments.is_empty() {
            info!(
                discarded_bytes = self.task.bytes_downloaded(),
                "resource changed or part-file unusable, re-planning"
            );
        }

        let threads = self.inner.thread_limit.load(Ordering::Relaxed);
        self.task.total_size = probe.total_size;
        self.task.supports_ranges = probe.supports_ranges;
        self.task.validator = probe.validator.clone();
        self.task.segments = plan_segments(
            probe.total_size,
            probe.supports_ranges,
            threads,
            self.inner.config.min_segment_size,
        );

        self.ensure_space(&part)?;
        let file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        if let Some(total) = probe.total_size {
            file.set_len(total)
                .await
                .map_err(|e| DownloadError::io(&part, e))?;
        }
        debug!(
            segments = self.task.segments.len(),
            total_size = ?probe.total_size,
            "planned segments"
        );
        Ok(())
    }

    /// Refuses a plan whose missing bytes do not fit next to the part-file.
    fn ensure_space(&self, part: &Path) -> Result<(), DownloadError> {
        let Some(total) = self.task.total_size else {
            return Ok(());
        };
        let dir = match part.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        ensure_free_space(dir, total.saturating_sub(self.task.bytes_downloaded()))
    }

    async fn plan_is_reusable(&self, probe: &ProbeResult, part: &Path) -> bool {
        if self.task.segments.is_empty()
            || self.task.total_size != probe.total_size
            || self.task.supports_ranges != probe.supports_ranges
            || !self.task.validator.matches(&probe.validator)
        {
            return false;
        }
        let Ok(metadata) = tokio::fs::metadata(part).await else {
            return false;
        };
        match self.task.total_size {
            Some(total) => metadata.len() == total,
            None => metadata.len() >= self.task.bytes_downloaded(),
        }
    }

    /// Runs one fetcher per unfinished segment until all have returned.
    async fn transfer(&mut self) -> Transfer {
        let config = &self.inner.config;
        let fetcher = Arc::new(SegmentFetcher {
            client: self.inner.client.clone(),
            store: Arc::clone(&self.inner.store),
            bandwidth: Arc::clone(&self.inner.bandwidth),
            policy: config.segment_retry_policy(),
            chunk_size: config.checkpoint_chunk_size,
            task_id: self.task.id,
            url: self.task.url.clone(),
            part_path: self.task.part_path(),
            validator: self.task.validator.clone(),
            supports_ranges: self.task.supports_ranges,
        });

        // Fetchers listen here so one failing segment can stop its siblings.
        let (local_stop, local_rx) = watch::channel(StopSignal::Run);
        let mut counters = Vec::with_capacity(self.task.segments.len());
        let mut fetchers = JoinSet::new();
        for segment in &mut self.task.segments {
            let counter = Arc::new(AtomicU64::new(segment.bytes_fetched));
            counters.push(Arc::clone(&counter));
            if segment.is_complete() {
                segment.state = SegmentState::Done;
                continue;
            }
            segment.state = SegmentState::Active;
            fetchers.spawn(Arc::clone(&fetcher).run(segment.clone(), counter, local_rx.clone()));
        }
        debug!(fetchers = fetchers.len(), "segment fetchers started");
        announce(self.inner, &self.task, self.speed);

        let mut meter = SpeedMeter::new(self.task.bytes_downloaded());
        let mut ticker = tokio::time::interval(config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut stop_signal = None;
        let mut failure = None;
        loop {
            let event = tokio::select! {
                joined = fetchers.join_next() => TransferEvent::Joined(joined),
                _ = ticker.tick() => TransferEvent::Tick,
                () = stop_requested(&mut self.stop), if stop_signal.is_none() => TransferEvent::Stop,
            };

            match event {
                TransferEvent::Joined(None) => break,
                TransferEvent::Joined(Some(Ok(outcome))) => {
                    let (segment, error) = match outcome {
                        FetchOutcome::Done(segment) | FetchOutcome::Stopped(segment) => {
                            (segment, None)
                        }
                        FetchOutcome::Failed(segment, error) => (segment, Some(error)),
                    };
                    if let Some(slot) = self
                        .task
                        .segments
                        .iter_mut()
                        .find(|s| s.index == segment.index)
                    {
                        *slot = segment;
                    }
                    if let Some(error) = error
                        && failure.is_none()
                    {
                        local_stop.send_replace(StopSignal::Pause);
                        failure = Some(error);
                    }
                }
                TransferEvent::Joined(Some(Err(join_error))) => {
                    error!(error = %join_error, "segment fetcher aborted");
                    if failure.is_none() {
                        local_stop.send_replace(StopSignal::Pause);
                        failure = Some(DownloadError::io(
                            self.task.part_path(),
                            std::io::Error::other(join_error.to_string()),
                        ));
                    }
                }
                TransferEvent::Tick => {
                    self.sync_progress(&counters);
                    self.speed = meter.sample(self.task.bytes_downloaded());
                    announce(self.inner, &self.task, self.speed);
                }
                TransferEvent::Stop => {
                    let signal = self.signal();
                    debug!(signal = ?signal, "stopping segment fetchers");
                    local_stop.send_replace(signal);
                    stop_signal = Some(signal);
                }
            }
        }

        if let Some(signal) = stop_signal {
            return Transfer::Stopped(signal);
        }
        if let Some(error) = failure {
            return Transfer::Failed(error);
        }
        if self
            .task
            .segments
            .iter()
            .any(|s| s.state != SegmentState::Done)
        {
            return Transfer::Failed(DownloadError::IncompleteBody {
                url: self.task.url.clone(),
                expected: self.task.total_size.unwrap_or_default(),
                received: self.task.bytes_downloaded(),
            });
        }
        if self.task.total_size.is_none() {
            self.task.total_size = Some(self.task.bytes_downloaded());
        }
        Transfer::Finished
    }

    fn sync_progress(&mut self, counters: &[Arc<AtomicU64>]) {
        for (segment, counter) in self.task.segments.iter_mut().zip(counters) {
            segment.bytes_fetched = segment.bytes_fetched.max(counter.load(Ordering::Relaxed));
        }
    }

    /// Checks the plan against the part-file, then moves it into place.
    async fn merge(&mut self) -> Result<(), DownloadError> {
        let part = self.task.part_path();
        let covered = self.task.bytes_downloaded();
        let total = self.task.total_size.unwrap_or(covered);
        if !is_contiguous(&self.task.segments, total) || covered != total {
            return Err(DownloadError::integrity(&part, total, covered));
        }

        let on_disk = tokio::fs::metadata(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?
            .len();
        if on_disk != total {
            return Err(DownloadError::integrity(&part, total, on_disk));
        }

        tokio::fs::rename(&part, &self.task.destination)
            .await
            .map_err(|e| DownloadError::io(&self.task.destination, e))?;
        debug!(path = %self.task.destination.display(), "part-file moved into place");
        Ok(())
    }

    async fn enter(&mut self, state: TaskState) -> Result<(), DownloadError> {
        if let Err(error) = self.task.transition(state) {
            error!(error = %error, "unexpected transition");
        }
        self.publish().await
    }

    async fn settle_stop(&mut self, signal: StopSignal) {
        self.task.park_segments();
        let next = match signal {
            StopSignal::Pause => Some(TaskState::Paused),
            StopSignal::Cancel => Some(TaskState::Canceled),
            StopSignal::Run | StopSignal::Shutdown => None,
        };
        match next {
            Some(next) => {
                if let Err(error) = self.task.transition(next) {
                    warn!(error = %error, "stop arrived in a state that cannot stop");
                }
            }
            None => self.task.touch(),
        }
        if self.task.state == TaskState::Canceled {
            remove_part_file(&self.task.part_path()).await;
        }
        self.speed = 0.0;
        // Failures are logged; recovery re-probes from the last checkpoints anyway.
        let _ = self.publish().await;
        info!(
            state = %self.task.state,
            bytes = self.task.bytes_downloaded(),
            "task stopped"
        );
    }

    async fn fail(&mut self, error: DownloadError) {
        error!(error = %error, kind = %error.kind(), "download failed");
        self.task.park_segments();
        if let Err(transition) = self.task.fail(TaskFailure::from(&error)) {
            error!(error = %transition, "cannot mark task failed");
        }
        self.speed = 0.0;
        let _ = self.publish().await;
    }

    async fn publish(&mut self) -> Result<(), DownloadError> {
        publish(self.inner, &self.task, self.speed)
            .await
            .map_err(DownloadError::from)
    }

    /// Current stop request; a vanished engine handle counts as shutdown.
    fn signal(&self) -> StopSignal {
        match *self.stop.borrow() {
            StopSignal::Run => StopSignal::Shutdown,
            signal => signal,
        }
    }
}
