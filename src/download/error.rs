//! Error types for the download module.
//!
//! [`DownloadError`] carries the concrete failure with its context (URL,
//! path, status). [`ErrorKind`] is the coarse taxonomy that tasks keep as
//! their last error and that progress subscribers see.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification of download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad URL, destination or checksum; rejected at submit, never retried.
    InvalidRequest,
    /// Timeout, reset or 5xx; retried at segment level, then task level.
    NetworkTransient,
    /// The resource no longer matches the validator captured at probe time.
    ResourceChanged,
    /// The server cannot serve ranges; informational, falls back to one stream.
    RangeUnsupported,
    /// The server permanently refused the resource (404, 410, other 4xx).
    RemoteRejected,
    /// Post-merge size or checksum mismatch.
    IntegrityError,
    /// Disk full, unwritable destination, or checkpoint store failure.
    StorageError,
    /// A schedule fired while the engine was saturated.
    SchedulerMisfire,
}

impl ErrorKind {
    /// Returns the stable string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::NetworkTransient => "network_transient",
            Self::ResourceChanged => "resource_changed",
            Self::RangeUnsupported => "range_unsupported",
            Self::RemoteRejected => "remote_rejected",
            Self::IntegrityError => "integrity_error",
            Self::StorageError => "storage_error",
            Self::SchedulerMisfire => "scheduler_misfire",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_request" => Ok(Self::InvalidRequest),
            "network_transient" => Ok(Self::NetworkTransient),
            "resource_changed" => Ok(Self::ResourceChanged),
            "range_unsupported" => Ok(Self::RangeUnsupported),
            "remote_rejected" => Ok(Self::RemoteRejected),
            "integrity_error" => Ok(Self::IntegrityError),
            "storage_error" => Ok(Self::StorageError),
            "scheduler_misfire" => Ok(Self::SchedulerMisfire),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

/// Errors that can occur while probing, fetching or finishing a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, reset, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or body read timed out.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// The body ended before the requested range was complete.
    #[error("body for {url} ended early: expected {expected} bytes, received {received}")]
    IncompleteBody {
        /// The URL being fetched.
        url: String,
        /// Bytes the range should have delivered.
        expected: u64,
        /// Bytes actually delivered.
        received: u64,
    },

    /// The server answered 416 for a range that should exist.
    #[error("range not satisfiable for {url}")]
    RangeNotSatisfiable {
        /// The URL being fetched.
        url: String,
    },

    /// The resource changed since it was probed.
    #[error("resource changed at {url}: {reason}")]
    ResourceChanged {
        /// The URL being fetched.
        url: String,
        /// What revealed the change.
        reason: String,
    },

    /// File system error while writing the download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The destination volume cannot hold the rest of the download.
    #[error("not enough space in {path}: need {required} bytes, {available} available")]
    InsufficientSpace {
        /// Directory of the part-file.
        path: PathBuf,
        /// Bytes still to be written, headroom included.
        required: u64,
        /// Bytes free on the volume.
        available: u64,
    },

    /// Merged file size does not match the expected total.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// File that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Merged file digest does not match the expected checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that failed verification.
        path: PathBuf,
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest.
        actual: String,
    },

    /// Persisting a checkpoint or task state failed.
    #[error("failed to persist download state: {0}")]
    Persistence(#[from] StoreError),
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a resource-changed error.
    pub fn resource_changed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceChanged {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a size mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Maps the error onto the task-level taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::IncompleteBody { .. } => {
                ErrorKind::NetworkTransient
            }
            Self::HttpStatus { status, .. } => {
                if *status == 408 || *status == 429 || *status >= 500 {
                    ErrorKind::NetworkTransient
                } else {
                    ErrorKind::RemoteRejected
                }
            }
            Self::RangeNotSatisfiable { .. } | Self::ResourceChanged { .. } => {
                ErrorKind::ResourceChanged
            }
            Self::Io { .. } | Self::InsufficientSpace { .. } | Self::Persistence(_) => {
                ErrorKind::StorageError
            }
            Self::InvalidUrl { .. } => ErrorKind::InvalidRequest,
            Self::Integrity { .. } | Self::ChecksumMismatch { .. } => ErrorKind::IntegrityError,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.bin", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://example.com/file.bin"));
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/test.bin"), io_error);
        assert!(error.to_string().contains("/tmp/test.bin"));
    }

    #[test]
    fn test_kind_for_http_statuses() {
        assert_eq!(
            DownloadError::http_status("u", 503).kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(
            DownloadError::http_status("u", 429).kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(
            DownloadError::http_status("u", 404).kind(),
            ErrorKind::RemoteRejected
        );
    }

    #[test]
    fn test_kind_for_range_and_validator_failures() {
        assert_eq!(
            DownloadError::RangeNotSatisfiable { url: "u".into() }.kind(),
            ErrorKind::ResourceChanged
        );
        assert_eq!(
            DownloadError::resource_changed("u", "etag differs").kind(),
            ErrorKind::ResourceChanged
        );
    }

    #[test]
    fn test_kind_for_local_failures() {
        let io = DownloadError::io("/x", std::io::Error::other("disk full"));
        assert_eq!(io.kind(), ErrorKind::StorageError);
        let full = DownloadError::InsufficientSpace {
            path: "/x".into(),
            required: 110,
            available: 5,
        };
        assert_eq!(full.kind(), ErrorKind::StorageError);
        assert!(full.to_string().contains("need 110 bytes"));
        assert_eq!(
            DownloadError::integrity("/x", 10, 9).kind(),
            ErrorKind::IntegrityError
        );
        assert_eq!(
            DownloadError::invalid_url("nope").kind(),
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_error_kind_round_trips_through_str() {
        for kind in [
            ErrorKind::InvalidRequest,
            ErrorKind::NetworkTransient,
            ErrorKind::ResourceChanged,
            ErrorKind::RangeUnsupported,
            ErrorKind::RemoteRejected,
            ErrorKind::IntegrityError,
            ErrorKind::StorageError,
            ErrorKind::SchedulerMisfire,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<ErrorKind>().is_err());
    }
}
