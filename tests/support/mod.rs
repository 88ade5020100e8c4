//! Shared helpers for integration tests: databases, engines and a
//! byte-range mock server that records what it serves.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use splitfetch_core::download::DownloadRequest;
use splitfetch_core::{
    Database, DownloadEngine, DownloadTask, EngineConfig, HttpClient, SqliteStore, TaskId,
    TaskStore,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Starts a mock server, or `None` when localhost sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_err() {
        eprintln!("[socket-bound-test] cannot bind localhost socket; skipping");
        return None;
    }
    Some(MockServer::start().await)
}

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = support::start_mock_server_or_skip().await else {
            return Ok(());
        };
        mock_server
    }};
}

/// Helper to create a file-backed test database with migrations applied.
pub async fn setup_test_db() -> Result<(Database, TempDir), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let db = Database::new(&temp_dir.path().join("test.db")).await?;
    Ok((db, temp_dir))
}

/// Small segments, short backoff and frequent progress, so tests stay fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        min_segment_size: 16 * 1024,
        checkpoint_chunk_size: 8 * 1024,
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        progress_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

pub async fn start_engine(
    db: Database,
    config: EngineConfig,
) -> Result<(DownloadEngine, Arc<dyn TaskStore>), Box<dyn std::error::Error>> {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::new(db));
    let engine = DownloadEngine::start(config, HttpClient::new()?, Arc::clone(&store)).await?;
    Ok((engine, store))
}

/// Deterministic, non-repeating-per-segment payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

/// Polls the engine until `done` holds for the task, or panics after `timeout`.
pub async fn wait_for(
    engine: &DownloadEngine,
    id: TaskId,
    timeout: Duration,
    done: impl Fn(&DownloadTask) -> bool,
) -> DownloadTask {
    let deadline = Instant::now() + timeout;
    loop {
        let task = engine.task(id).unwrap();
        if done(&task) {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting; task is {} with {} bytes",
            task.state,
            task.bytes_downloaded()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn request(server: &MockServer, file: &str, dir: &TempDir) -> DownloadRequest {
    DownloadRequest::new(format!("{}/{file}", server.uri()), dir.path().join(file))
}

struct Resource {
    body: Arc<Vec<u8>>,
    etag: String,
}

/// Handle on a mounted [`RangeResponder`].
#[derive(Clone)]
pub struct RangeServer {
    resource: Arc<Mutex<Resource>>,
    /// Bytes the server was asked for, summed over all responses.
    pub requested_bytes: Arc<AtomicU64>,
    pub requests: Arc<AtomicUsize>,
}

impl RangeServer {
    /// Serves a new version of the resource under a new ETag.
    pub fn replace(&self, body: Vec<u8>, etag: &str) {
        let mut resource = self.resource.lock().unwrap();
        resource.body = Arc::new(body);
        resource.etag = etag.to_string();
    }

    pub fn requested(&self) -> u64 {
        self.requested_bytes.load(Ordering::SeqCst)
    }
}

/// Serves `Range` requests like a real file server: 206 slices with
/// `Content-Range`, honoring `If-Range`, or whole bodies when ranges are off.
struct RangeResponder {
    resource: Arc<Mutex<Resource>>,
    ranges: bool,
    requested_bytes: Arc<AtomicU64>,
    requests: Arc<AtomicUsize>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (body, etag) = {
            let resource = self.resource.lock().unwrap();
            (Arc::clone(&resource.body), resource.etag.clone())
        };
        let total = body.len() as u64;
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let if_range_ok = header("if-range").is_none_or(|value| value == etag);
        let range = header("range")
            .filter(|_| self.ranges && if_range_ok)
            .and_then(|v| {
                let (start, end) = v.strip_prefix("bytes=")?.split_once('-')?;
                let start: u64 = start.parse().ok()?;
                let end: Option<u64> = end.parse().ok();
                Some((start, end))
            });

        let template = match range {
            Some((start, _)) if start >= total => {
                return ResponseTemplate::new(416)
                    .insert_header("content-range", format!("bytes */{total}"));
            }
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                self.requested_bytes
                    .fetch_add(end - start + 1, Ordering::SeqCst);
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes {start}-{end}/{total}"))
                    .set_body_bytes(body[start as usize..=end as usize].to_vec())
            }
            None => {
                self.requested_bytes.fetch_add(total, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_bytes(body.to_vec())
            }
        };
        let template = template.insert_header("etag", etag.as_str());
        if self.ranges {
            template.insert_header("accept-ranges", "bytes")
        } else {
            template
        }
    }
}

/// Mounts a range-capable (or not) responder for `GET /{file}`.
pub async fn mount_file(
    server: &MockServer,
    file: &str,
    body: Vec<u8>,
    ranges: bool,
) -> RangeServer {
    let handle = RangeServer {
        resource: Arc::new(Mutex::new(Resource {
            body: Arc::new(body),
            etag: "\"v1\"".to_string(),
        })),
        requested_bytes: Arc::new(AtomicU64::new(0)),
        requests: Arc::new(AtomicUsize::new(0)),
    };
    Mock::given(method("GET"))
        .and(path(format!("/{file}")))
        .respond_with(RangeResponder {
            resource: Arc::clone(&handle.resource),
            ranges,
            requested_bytes: Arc::clone(&handle.requested_bytes),
            requests: Arc::clone(&handle.requests),
        })
        .mount(server)
        .await;
    handle
}
