//! Byte-range segments and segment planning.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Planned, no fetcher has run yet.
    Pending,
    /// A fetcher is streaming into it.
    Active,
    /// Stopped by pause, cancel or shutdown; resumes at its checkpoint.
    Paused,
    /// Every byte of the range is on disk.
    Done,
    /// Exhausted its local retries or hit a non-retryable error.
    Failed,
}

impl SegmentState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SegmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid segment state: {s}")),
        }
    }
}

/// A contiguous byte range of the resource, fetched independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the plan; plan order is byte order.
    pub index: u32,
    /// First byte of the range within the resource.
    pub offset: u64,
    /// Range length; `None` only for the open-ended segment of an unknown-size resource.
    pub length: Option<u64>,
    /// Durable count of bytes already written at `offset`.
    pub bytes_fetched: u64,
    /// Current lifecycle state.
    pub state: SegmentState,
}

impl Segment {
    /// Creates a pending segment with nothing fetched.
    #[must_use]
    pub fn new(index: u32, offset: u64, length: Option<u64>) -> Self {
        Self {
            index,
            offset,
            length,
            bytes_fetched: 0,
            state: SegmentState::Pending,
        }
    }

    /// Absolute offset where the next byte belongs.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.offset + self.bytes_fetched
    }

    /// Exclusive end offset, when the length is known.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.length.map(|length| self.offset + length)
    }

    /// Bytes still missing, when the length is known.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.length
            .map(|length| length.saturating_sub(self.bytes_fetched))
    }

    /// True once every byte of a known-length range has been fetched.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }
}

/// Splits a resource into segments.
///
/// Resources without range support or with an unknown size always get a
/// single segment. Otherwise the count is
/// `min(thread_limit, ceil(total / min_segment_size))`, at least one, and
/// the first `total % count` segments carry one extra byte.
#[must_use]
pub fn plan_segments(
    total_size: Option<u64>,
    supports_ranges: bool,
    thread_limit: usize,
    min_segment_size: u64,
) -> Vec<Segment> {
    let Some(total) = total_size else {
        return vec![Segment::new(0, 0, None)];
    };
    if !supports_ranges {
        return vec![Segment::new(0, 0, Some(total))];
    }

    let by_size = total.div_ceil(min_segment_size.max(1));
    let count = by_size.min(thread_limit as u64).max(1);
    let base = total / count;
    let extra = total % count;

    let mut segments = Vec::new();
    let mut offset = 0;
    for index in 0..count {
        let length = base + u64::from(index < extra);
        #[allow(clippy::cast_possible_truncation)]
        segments.push(Segment::new(index as u32, offset, Some(length)));
        offset += length;
    }
    segments
}

/// Checks that segments are ordered, non-overlapping and cover `[0, total)`.
#[must_use]
pub fn is_contiguous(segments: &[Segment], total_size: u64) -> bool {
    let mut expected = 0;
    for segment in segments {
        if segment.offset != expected {
            return false;
        }
        match segment.length {
            Some(length) => expected += length,
            None => return false,
        }
    }
    expected == total_size
}
