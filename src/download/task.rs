//! Download task model and its state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::Validator;
use super::constants::PART_FILE_SUFFIX;
use super::error::{DownloadError, ErrorKind};
use super::segment::{Segment, SegmentState};

/// Opaque, immutable task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid task id '{s}': {e}"))
    }
}

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, waiting for admission or for its schedule.
    Pending,
    /// Asking the server for size, range support and validator.
    Probing,
    /// Segment fetchers are running.
    Downloading,
    /// Stopped by the user; resumes from checkpoints.
    Paused,
    /// Checking the part-file and moving it into place.
    Merging,
    /// Checking size and checksum of the final file.
    Verifying,
    /// Finished and verified.
    Completed,
    /// Gave up; see `last_error`.
    Failed,
    /// Stopped for good by the user.
    Canceled,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Probing,
        Self::Downloading,
        Self::Paused,
        Self::Merging,
        Self::Verifying,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Probing => "probing",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Completed, Failed and Canceled tasks run no further without a retry.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// States in which a driver owns the task.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Probing | Self::Downloading | Self::Merging | Self::Verifying
        )
    }

    /// Whether the state machine permits `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::{
            Canceled, Completed, Downloading, Failed, Merging, Paused, Pending, Probing, Verifying,
        };
        matches!(
            (self, next),
            (Pending, Probing | Paused | Canceled)
                | (Probing, Probing | Downloading | Paused | Failed | Canceled)
                | (Downloading, Probing | Merging | Paused | Failed | Canceled)
                | (Merging, Verifying | Failed | Probing)
                | (Verifying, Completed | Failed | Probing)
                | (Paused, Probing | Canceled)
                | (Failed, Pending | Canceled)
                | (Canceled | Completed, Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid task state: {s}"))
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State the task was in.
    pub from: TaskState,
    /// State that was requested.
    pub to: TaskState,
}

/// The most recent failure of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Coarse classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&DownloadError> for TaskFailure {
    fn from(error: &DownloadError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One download: what to fetch, where to put it, and how far it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique identifier.
    pub id: TaskId,
    /// Source URL.
    pub url: String,
    /// Final path of the downloaded file.
    pub destination: PathBuf,
    /// Resource size from the last probe; `None` when the server did not say.
    pub total_size: Option<u64>,
    /// Whether the last probe saw byte-range support.
    pub supports_ranges: bool,
    /// Resource version captured by the last probe.
    pub validator: Validator,
    /// Segment plan in byte order.
    pub segments: Vec<Segment>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Task-level retries consumed.
    pub retry_count: u32,
    /// Task-level retry budget.
    pub max_retries: u32,
    /// Expected digest (`sha256:<hex>` or bare hex).
    pub checksum: Option<String>,
    /// Waiting for the scheduler rather than the admission queue.
    pub scheduled: bool,
    /// Most recent failure, kept until retry or removal.
    pub last_error: Option<TaskFailure>,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    /// Last modification time, unix milliseconds.
    pub updated_at: i64,
}

impl DownloadTask {
    /// Creates a pending task with no plan.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        checksum: Option<String>,
        max_retries: u32,
    ) -> Self {
        let now = now_millis();
        Self {
            id: TaskId::new(),
            url: url.into(),
            destination: destination.into(),
            total_size: None,
            supports_ranges: false,
            validator: Validator::default(),
            segments: Vec::new(),
            state: TaskState::Pending,
            retry_count: 0,
            max_retries,
            checksum,
            scheduled: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of bytes fetched over all segments.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_fetched).sum()
    }

    /// Path segments are written to until merge.
    #[must_use]
    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.destination)
    }

    /// Applies a state change if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for any change outside the state machine.
    pub fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Records a failure and moves to Failed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the current state cannot fail.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Failed)?;
        self.last_error = Some(failure);
        Ok(())
    }

    /// Moves a finished task back to Pending for another run.
    ///
    /// Counters and the last error are cleared. A completed task also drops
    /// its plan, since its part-file no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the task is Failed, Canceled or Completed.
    pub fn reset_for_rerun(&mut self) -> Result<(), InvalidTransition> {
        let was_completed = self.state == TaskState::Completed;
        self.transition(TaskState::Pending)?;
        self.retry_count = 0;
        self.last_error = None;
        if was_completed {
            self.segments.clear();
            self.total_size = None;
            self.validator = Validator::default();
        }
        Ok(())
    }

    /// Marks every unfinished segment Paused so none is persisted as Active.
    pub fn park_segments(&mut self) {
        for segment in &mut self.segments {
            if matches!(segment.state, SegmentState::Active | SegmentState::Failed) {
                segment.state = SegmentState::Paused;
            }
        }
    }

    /// Updates the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// Part-file path for a destination: `<destination>.part`.
#[must_use]
pub fn part_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PART_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
