//! Constants for the download module (timeouts, segment sizing, pacing).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-read timeout (60 seconds without a single body byte).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Default maximum number of tasks downloading at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default maximum number of segment fetchers per task.
pub const DEFAULT_MAX_THREADS_PER_DOWNLOAD: usize = 8;

/// Smallest segment worth a dedicated fetcher (1 MiB).
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Bytes buffered before a segment writes and checkpoints (64 KiB).
pub const DEFAULT_CHECKPOINT_CHUNK_SIZE: usize = 64 * 1024;

/// Interval between progress events for a running task.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the progress broadcast channel.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Suffix of the in-place part-file next to the destination.
pub const PART_FILE_SUFFIX: &str = ".part";
