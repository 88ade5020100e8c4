//! Segmented, resumable HTTP downloads.
//!
//! A download is split into byte ranges fetched in parallel into one
//! part-file, checkpointed as it goes, then merged and verified.
//!
//! # Features
//!
//! - Range probing with ETag/Last-Modified validators
//! - Per-segment retry with exponential backoff and `Retry-After`
//! - Task-level re-probe when a resource changes or segments give up
//! - Global bandwidth shaping shared by all fetchers
//! - Durable checkpoints through [`TaskStore`](crate::store::TaskStore)
//! - SHA-256 verification of the merged file
//!
//! # Example
//!
//! ```no_run
//! use splitfetch_core::download::{HttpClient, plan_segments};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let probe = client.probe("https://example.com/image.iso").await?;
//! let plan = plan_segments(probe.total_size, probe.supports_ranges, 8, 1024 * 1024);
//! println!("{} segments", plan.len());
//! # Ok(())
//! # }
//! ```

mod bandwidth;
mod client;
pub mod constants;
mod engine;
mod error;
mod fetcher;
mod filename;
mod integrity;
mod progress;
mod retry;
mod segment;
mod storage;
mod task;

pub use bandwidth::BandwidthLimiter;
pub use client::{
    ByteRange, HttpClient, ProbeResult, RangeStream, Validator, parse_content_range_total,
};
pub use engine::{DownloadEngine, DownloadRequest, EngineError, EngineStatistics};
pub use error::{DownloadError, ErrorKind};
pub use integrity::{parse_checksum, sha256_file, verify_file};
pub use progress::{ProgressEvent, SpeedMeter, estimate_eta};
pub use retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_SEGMENT_MAX_RETRIES, DEFAULT_TASK_MAX_RETRIES, FailureType, RetryDecision,
    RetryPolicy, classify_error, parse_retry_after, retry_after_delay,
};
pub use segment::{Segment, SegmentState, is_contiguous, plan_segments};
pub use task::{
    DownloadTask, InvalidTransition, TaskFailure, TaskId, TaskState, now_millis, part_path_for,
};
