//! Progress events and transfer speed estimation.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::task::{DownloadTask, TaskFailure, TaskId, TaskState};

/// Smoothing factor of the speed average; higher reacts faster.
const SPEED_SMOOTHING: f64 = 0.3;

/// Snapshot of one task, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Task the event describes.
    pub task_id: TaskId,
    /// State at the time of the event.
    pub state: TaskState,
    /// Bytes durably received so far.
    pub bytes_downloaded: u64,
    /// Resource size when known.
    pub total_size: Option<u64>,
    /// Smoothed transfer rate.
    pub speed_bytes_per_sec: f64,
    /// Remaining time estimate, when speed and size are known.
    pub eta: Option<Duration>,
    /// Last failure, present on Failed events.
    pub error: Option<TaskFailure>,
}

impl ProgressEvent {
    /// Builds an event from a task snapshot and a current speed.
    #[must_use]
    pub fn from_task(task: &DownloadTask, speed_bytes_per_sec: f64) -> Self {
        let bytes_downloaded = task.bytes_downloaded();
        Self {
            task_id: task.id,
            state: task.state,
            bytes_downloaded,
            total_size: task.total_size,
            speed_bytes_per_sec,
            eta: estimate_eta(bytes_downloaded, task.total_size, speed_bytes_per_sec),
            error: task.last_error.clone(),
        }
    }

    /// Fraction complete in `[0, 1]`, when the size is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// `remaining / speed`, when both are meaningful.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate_eta(
    downloaded: u64,
    total: Option<u64>,
    speed_bytes_per_sec: f64,
) -> Option<Duration> {
    let remaining = total?.saturating_sub(downloaded);
    if speed_bytes_per_sec <= f64::EPSILON {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / speed_bytes_per_sec))
}

/// Exponentially smoothed bytes-per-second meter.
#[derive(Debug)]
pub struct SpeedMeter {
    last_bytes: u64,
    last_sample: Instant,
    speed: f64,
    primed: bool,
}

impl SpeedMeter {
    /// Starts measuring from `bytes` already on disk.
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        Self {
            last_bytes: bytes,
            last_sample: Instant::now(),
            speed: 0.0,
            primed: false,
        }
    }

    /// Feeds the current byte total and returns the smoothed speed.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, bytes: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return self.speed;
        }

        let delta = bytes.saturating_sub(self.last_bytes) as f64;
        let instant = delta / elapsed;
        self.speed = if self.primed {
            SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * self.speed
        } else {
            instant
        };
        self.primed = true;
        self.last_bytes = bytes;
        self.last_sample = now;
        self.speed
    }

    /// Last computed speed.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }
}
