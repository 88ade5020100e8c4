//! Engine configuration.

use std::time::Duration;

use crate::download::constants::{
    DEFAULT_CHECKPOINT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_DOWNLOADS,
    DEFAULT_MAX_THREADS_PER_DOWNLOAD, DEFAULT_MIN_SEGMENT_SIZE, DEFAULT_PROGRESS_INTERVAL,
};
use crate::download::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_SEGMENT_MAX_RETRIES, DEFAULT_TASK_MAX_RETRIES, EngineError, RetryPolicy,
};

/// Tunables of a [`DownloadEngine`](crate::download::DownloadEngine).
///
/// The concurrency limits and the bandwidth limit can also be changed on a
/// running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Tasks allowed to download at once.
    pub max_concurrent_downloads: usize,
    /// Segment fetchers per task.
    pub max_threads_per_download: usize,
    /// Aggregate bytes per second, `None` for unlimited.
    pub bandwidth_limit: Option<u64>,
    /// Consecutive failures a segment tolerates before it fails.
    pub segment_max_retries: u32,
    /// Re-probe/re-plan rounds a task tolerates before it fails.
    pub task_max_retries: u32,
    /// Segments are never planned smaller than this.
    pub min_segment_size: u64,
    /// Bytes buffered per segment between checkpoints.
    pub checkpoint_chunk_size: usize,
    /// First backoff delay.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Backoff growth per attempt.
    pub retry_backoff_multiplier: f32,
    /// Minimum spacing of progress events per running task.
    pub progress_interval: Duration,
    /// File downloads into a per-type subdirectory (`videos/`, `archives/`, ...)
    /// when the destination is a directory.
    pub organize_by_category: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_threads_per_download: DEFAULT_MAX_THREADS_PER_DOWNLOAD,
            bandwidth_limit: None,
            segment_max_retries: DEFAULT_SEGMENT_MAX_RETRIES,
            task_max_retries: DEFAULT_TASK_MAX_RETRIES,
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            checkpoint_chunk_size: DEFAULT_CHECKPOINT_CHUNK_SIZE,
            retry_base_delay: DEFAULT_BASE_DELAY,
            retry_max_delay: DEFAULT_MAX_DELAY,
            retry_backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            organize_by_category: false,
        }
    }
}

impl EngineConfig {
    /// Rejects zero limits and sizes and a shrinking backoff.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| Err(EngineError::InvalidConfig(reason.to_string()));

        if self.max_concurrent_downloads == 0 {
            return invalid("max_concurrent_downloads must be at least 1");
        }
        if self.max_threads_per_download == 0 {
            return invalid("max_threads_per_download must be at least 1");
        }
        if self.segment_max_retries == 0 {
            return invalid("segment_max_retries must be at least 1");
        }
        if self.min_segment_size == 0 {
            return invalid("min_segment_size must be greater than 0");
        }
        if self.checkpoint_chunk_size == 0 {
            return invalid("checkpoint_chunk_size must be greater than 0");
        }
        if self.bandwidth_limit == Some(0) {
            return invalid("bandwidth_limit must be greater than 0 (use None for unlimited)");
        }
        if self.retry_backoff_multiplier < 1.0 {
            return invalid("retry_backoff_multiplier must be at least 1.0");
        }
        if self.retry_max_delay < self.retry_base_delay {
            return invalid("retry_max_delay must not be below retry_base_delay");
        }
        if self.progress_interval.is_zero() {
            return invalid("progress_interval must be greater than 0");
        }
        Ok(())
    }

    /// Backoff policy for consecutive failures of one segment.
    #[must_use]
    pub fn segment_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.segment_max_retries,
            self.retry_base_delay,
            self.retry_max_delay,
            self.retry_backoff_multiplier,
        )
    }

    /// Backoff policy between task-level retries.
    ///
    /// The budget itself lives on each task (`max_retries`); this policy
    /// only supplies the delays.
    #[must_use]
    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            u32::MAX,
            self.retry_base_delay,
            self.retry_max_delay,
            self.retry_backoff_multiplier,
        )
    }
}
