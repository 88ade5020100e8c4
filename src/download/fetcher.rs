//! Segment fetcher: drives one byte range into the part-file.
//!
//! A fetcher owns a working copy of its [`Segment`] and hands it back in a
//! [`FetchOutcome`]. Bytes are buffered up to the checkpoint chunk size,
//! then written at their final offset, flushed and checkpointed, so a crash
//! costs at most one chunk per segment.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use super::bandwidth::BandwidthLimiter;
use super::client::{ByteRange, HttpClient, Validator};
use super::error::DownloadError;
use super::retry::{RetryDecision, RetryPolicy, classify_error, retry_after_delay};
use super::segment::{Segment, SegmentState};
use super::task::TaskId;
use crate::store::TaskStore;

/// Why the engine wants running fetchers to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    Run,
    Pause,
    Cancel,
    Shutdown,
}

impl StopSignal {
    pub(crate) fn is_stop(self) -> bool {
        self != Self::Run
    }
}

/// Resolves once a stop is requested or the engine side went away.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<StopSignal>) {
    let _ = stop.wait_for(|signal| signal.is_stop()).await;
}

/// How a fetcher finished; always carries the segment back.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    Done(Segment),
    Stopped(Segment),
    Failed(Segment, DownloadError),
}

enum StreamEnd {
    Finished,
    Stopped,
}

/// Everything the fetchers of one task share.
pub(crate) struct SegmentFetcher {
    pub(crate) client: HttpClient,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) bandwidth: Arc<BandwidthLimiter>,
    pub(crate) policy: RetryPolicy,
    pub(crate) chunk_size: usize,
    pub(crate) task_id: TaskId,
    pub(crate) url: String,
    pub(crate) part_path: PathBuf,
    pub(crate) validator: Validator,
    pub(crate) supports_ranges: bool,
}

impl SegmentFetcher {
    /// Fetches the rest of `segment`, retrying transient failures.
    ///
    /// `progress` mirrors the checkpointed byte count for progress reporting.
    #[instrument(skip_all, fields(task_id = %self.task_id, segment = segment.index))]
    pub(crate) async fn run(
        self: Arc<Self>,
        mut segment: Segment,
        progress: Arc<AtomicU64>,
        mut stop: watch::Receiver<StopSignal>,
    ) -> FetchOutcome {
        segment.state = SegmentState::Active;
        let mut failures = 0;

        loop {
            if stop.borrow().is_stop() {
                segment.state = SegmentState::Paused;
                return FetchOutcome::Stopped(segment);
            }
            if segment.is_complete() {
                segment.state = SegmentState::Done;
                return FetchOutcome::Done(segment);
            }

            let before = segment.bytes_fetched;
            let error = match self.stream_once(&mut segment, &progress, &mut stop).await {
                Ok(StreamEnd::Finished) => {
                    debug!(bytes = segment.bytes_fetched, "segment complete");
                    segment.state = SegmentState::Done;
                    return FetchOutcome::Done(segment);
                }
                Ok(StreamEnd::Stopped) => {
                    debug!(bytes = segment.bytes_fetched, "segment stopped");
                    segment.state = SegmentState::Paused;
                    return FetchOutcome::Stopped(segment);
                }
                Err(error) => error,
            };

            if segment.bytes_fetched > before {
                failures = 0;
            }
            failures += 1;

            match self.policy.should_retry(classify_error(&error), failures) {
                RetryDecision::Retry { delay, attempt } => {
                    let delay = retry_after_delay(&error).unwrap_or(delay);
                    warn!(
                        error = %error,
                        attempt,
                        delay_ms = delay.as_millis(),
                        resume_at = segment.resume_offset(),
                        "segment fetch failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = stop_requested(&mut stop) => {
                            segment.state = SegmentState::Paused;
                            return FetchOutcome::Stopped(segment);
                        }
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %error, reason = %reason, "segment failed");
                    segment.state = SegmentState::Failed;
                    return FetchOutcome::Failed(segment, error);
                }
            }
        }
    }

    async fn stream_once(
        &self,
        segment: &mut Segment,
        progress: &AtomicU64,
        stop: &mut watch::Receiver<StopSignal>,
    ) -> Result<StreamEnd, DownloadError> {
        // Without range support the body always starts at byte 0; skip what we hold.
        let (range, mut skip) = if self.supports_ranges {
            let range = ByteRange {
                start: segment.resume_offset(),
                end: segment.end().map(|end| end - 1),
            };
            (Some(range), 0)
        } else {
            (None, segment.bytes_fetched)
        };

        let mut stream = tokio::select! {
            result = self.client.fetch(&self.url, range, &self.validator) => result?,
            () = stop_requested(stop) => return Ok(StreamEnd::Stopped),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.part_path)
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;
        file.seek(SeekFrom::Start(segment.resume_offset()))
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;

        let mut buffer: Vec<u8> = Vec::with_capacity(self.chunk_size);
        let end = loop {
            let next = tokio::select! {
                biased;
                () = stop_requested(stop) => break StreamEnd::Stopped,
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break StreamEnd::Finished;
            };
            let mut data = match chunk {
                Ok(data) => data,
                Err(error) => {
                    self.checkpoint(&mut file, segment, &mut buffer, progress)
                        .await?;
                    return Err(error);
                }
            };

            if skip > 0 {
                let skipped = usize::try_from(skip).unwrap_or(usize::MAX).min(data.len());
                data = data.slice(skipped..);
                skip -= skipped as u64;
                if data.is_empty() {
                    continue;
                }
            }

            if let Some(remaining) = segment.remaining() {
                let room = remaining.saturating_sub(buffer.len() as u64);
                if data.len() as u64 > room {
                    data.truncate(usize::try_from(room).unwrap_or(usize::MAX));
                }
            }
            if data.is_empty() {
                break StreamEnd::Finished;
            }

            tokio::select! {
                biased;
                () = stop_requested(stop) => break StreamEnd::Stopped,
                () = self.bandwidth.acquire(data.len() as u64) => {}
            }

            buffer.extend_from_slice(&data);
            if buffer.len() >= self.chunk_size {
                self.checkpoint(&mut file, segment, &mut buffer, progress)
                    .await?;
            }
            if segment.remaining() == Some(buffer.len() as u64) {
                break StreamEnd::Finished;
            }
        };

        self.checkpoint(&mut file, segment, &mut buffer, progress)
            .await?;

        match end {
            StreamEnd::Stopped => Ok(StreamEnd::Stopped),
            StreamEnd::Finished => match segment.length {
                Some(length) if !segment.is_complete() => Err(DownloadError::IncompleteBody {
                    url: self.url.clone(),
                    expected: length,
                    received: segment.bytes_fetched,
                }),
                Some(_) => Ok(StreamEnd::Finished),
                None => {
                    segment.length = Some(segment.bytes_fetched);
                    Ok(StreamEnd::Finished)
                }
            },
        }
    }

    /// Writes the buffer at the segment's resume offset, then records it durably.
    async fn checkpoint(
        &self,
        file: &mut File,
        segment: &mut Segment,
        buffer: &mut Vec<u8>,
        progress: &AtomicU64,
    ) -> Result<(), DownloadError> {
        if buffer.is_empty() {
            return Ok(());
        }
        file.write_all(buffer)
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;
        file.flush()
            .await
            .map_err(|e| DownloadError::io(&self.part_path, e))?;

        let bytes_fetched = segment.bytes_fetched + buffer.len() as u64;
        self.store
            .save_segment_checkpoint(self.task_id, segment.index, bytes_fetched)
            .await?;
        segment.bytes_fetched = bytes_fetched;
        progress.store(bytes_fetched, Ordering::Relaxed);
        trace!(bytes_fetched, "checkpoint");
        buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use crate::db::Database;
    use crate::download::DownloadTask;
    use crate::store::SqliteStore;

    /// Serves `Range: bytes=a-b` slices of `body`, failing the first `failures` requests.
    struct SliceResponder {
        body: Vec<u8>,
        failures: usize,
        requests: Arc<AtomicUsize>,
    }

    impl Respond for SliceResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            if self.requests.fetch_add(1, Ordering::SeqCst) < self.failures {
                return ResponseTemplate::new(503);
            }
            let total = self.body.len();
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.split_once('-'));
            match range {
                Some((start, end)) => {
                    let start: usize = start.parse().unwrap();
                    let end: usize = end.parse().map_or(total - 1, |e: usize| e.min(total - 1));
                    ResponseTemplate::new(206)
                        .insert_header("content-range", format!("bytes {start}-{end}/{total}"))
                        .set_body_bytes(self.body[start..=end].to_vec())
                }
                None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
            }
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn setup(
        body: Vec<u8>,
        failures: usize,
        supports_ranges: bool,
        segment: Segment,
    ) -> (MockServer, tempfile::TempDir, Arc<SegmentFetcher>, Arc<AtomicUsize>) {
        let server = MockServer::start().await;
        let requests = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(SliceResponder {
                body,
                failures,
                requests: Arc::clone(&requests),
            })
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(Database::new_in_memory().await.unwrap());
        let mut task = DownloadTask::new(server.uri(), dir.path().join("out.bin"), None, 3);
        task.segments = vec![segment];
        store.save_task_state(&task).await.unwrap();

        let fetcher = Arc::new(SegmentFetcher {
            client: HttpClient::new().unwrap(),
            store: Arc::new(store),
            bandwidth: Arc::new(BandwidthLimiter::new(None)),
            policy: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20), 2.0),
            chunk_size: 1000,
            task_id: task.id,
            url: server.uri(),
            part_path: task.part_path(),
            validator: Validator::default(),
            supports_ranges,
        });
        (server, dir, fetcher, requests)
    }

    #[tokio::test]
    async fn test_fetches_range_into_place() {
        let data = body(5000);
        let segment = Segment::new(0, 1000, Some(3000));
        let (_server, _dir, fetcher, _) = setup(data.clone(), 0, true, segment).await;
        let (_tx, rx) = watch::channel(StopSignal::Run);
        let progress = Arc::new(AtomicU64::new(0));

        let outcome = Arc::clone(&fetcher)
            .run(Segment::new(0, 1000, Some(3000)), Arc::clone(&progress), rx)
            .await;

        let FetchOutcome::Done(segment) = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        assert_eq!(segment.bytes_fetched, 3000);
        assert_eq!(segment.state, SegmentState::Done);
        assert_eq!(progress.load(Ordering::SeqCst), 3000);

        let written = tokio::fs::read(&fetcher.part_path).await.unwrap();
        assert_eq!(&written[1000..4000], &data[1000..4000]);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let data = body(2000);
        let (_server, _dir, fetcher, requests) =
            setup(data.clone(), 2, true, Segment::new(0, 0, Some(2000))).await;
        let (_tx, rx) = watch::channel(StopSignal::Run);

        let outcome = Arc::clone(&fetcher)
            .run(Segment::new(0, 0, Some(2000)), Arc::new(AtomicU64::new(0)), rx)
            .await;

        assert!(matches!(outcome, FetchOutcome::Done(_)), "{outcome:?}");
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert_eq!(tokio::fs::read(&fetcher.part_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_fails_after_consecutive_failures() {
        let (_server, _dir, fetcher, requests) =
            setup(body(100), 10, true, Segment::new(0, 0, Some(100))).await;
        let (_tx, rx) = watch::channel(StopSignal::Run);

        let outcome = Arc::clone(&fetcher)
            .run(Segment::new(0, 0, Some(100)), Arc::new(AtomicU64::new(0)), rx)
            .await;

        let FetchOutcome::Failed(segment, error) = outcome else {
            panic!("expected Failed");
        };
        assert_eq!(segment.state, SegmentState::Failed);
        assert!(matches!(error, DownloadError::HttpStatus { status: 503, .. }));
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_range_server_skips_held_bytes() {
        let data = body(3000);
        let mut segment = Segment::new(0, 0, Some(3000));
        segment.bytes_fetched = 1200;
        let (_server, _dir, fetcher, _) = setup(data.clone(), 0, false, segment.clone()).await;
        tokio::fs::write(&fetcher.part_path, &data[..1200]).await.unwrap();
        let (_tx, rx) = watch::channel(StopSignal::Run);

        let outcome = Arc::clone(&fetcher)
            .run(segment, Arc::new(AtomicU64::new(0)), rx)
            .await;

        assert!(matches!(outcome, FetchOutcome::Done(_)), "{outcome:?}");
        assert_eq!(tokio::fs::read(&fetcher.part_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_stop_before_start_returns_paused() {
        let (_server, _dir, fetcher, requests) =
            setup(body(100), 0, true, Segment::new(0, 0, Some(100))).await;
        let (tx, rx) = watch::channel(StopSignal::Run);
        tx.send(StopSignal::Pause).unwrap();

        let outcome = Arc::clone(&fetcher)
            .run(Segment::new(0, 0, Some(100)), Arc::new(AtomicU64::new(0)), rx)
            .await;

        let FetchOutcome::Stopped(segment) = outcome else {
            panic!("expected Stopped");
        };
        assert_eq!(segment.state, SegmentState::Paused);
        assert_eq!(requests.load(Ordering::SeqCst), 0);
    }
}
