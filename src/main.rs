//! CLI entry point for splitfetch.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use splitfetch_core::download::DownloadRequest;
use splitfetch_core::{Database, HttpClient, Manager, SqliteStore, TaskState, TaskStore};
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress_ui;

use cli::Args;

/// How often the run loop checks whether all work has settled.
const SETTLE_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let file_config = app_config::load_default_file_config()?;
    let settings = args.settings(file_config.as_ref())?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config file > info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");
    info!(db = %settings.db_path.display(), "splitfetch starting");

    if let Some(parent) = settings.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let db = Database::new(&settings.db_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", settings.db_path.display()))?;
    let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::new(db));
    let client = HttpClient::new_with_timeouts(
        settings.connect_timeout_secs,
        settings.read_timeout_secs,
    )
    .context("Failed to build HTTP client")?;

    let manager = Manager::start(settings.engine.clone(), client, store).await?;
    let events = manager.subscribe();

    let mut names = HashMap::new();
    for url in &args.urls {
        let mut request = DownloadRequest::new(url.clone(), settings.output_dir.clone());
        request.checksum.clone_from(&args.checksum);
        request.schedule = settings.schedule;
        match manager.submit(request).await {
            Ok(id) => {
                info!(task_id = %id, url = %url, "download submitted");
                names.insert(id, short_name(url));
            }
            Err(error) => warn!(url = %url, error = %error, "download rejected"),
        }
    }
    for task in manager.tasks() {
        names
            .entry(task.id)
            .or_insert_with(|| short_name(&task.url));
    }

    let show_bars = !args.quiet && std::io::stderr().is_terminal();
    let (ui, stop_ui) = progress_ui::spawn_progress_ui(show_bars, events, names);

    tokio::select! {
        () = wait_until_settled(&manager) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("interrupted, saving progress for the next run");
        }
    }
    manager.shutdown().await;

    stop_ui.store(true, Ordering::SeqCst);
    if let Some(ui) = ui {
        let _ = ui.await;
    }

    let stats = manager.statistics();
    info!(
        completed = stats.count(TaskState::Completed),
        failed = stats.count(TaskState::Failed),
        paused = stats.count(TaskState::Paused),
        bytes = stats.bytes_downloaded,
        "run finished"
    );
    for task in manager.tasks() {
        if let (TaskState::Failed, Some(error)) = (task.state, &task.last_error) {
            warn!(url = %task.url, kind = %error.kind, error = %error.message, "download failed");
        }
    }

    let failed = stats.count(TaskState::Failed);
    if failed > 0 {
        bail!("{failed} download(s) failed");
    }
    Ok(())
}

/// Returns once nothing is running, queued or scheduled.
async fn wait_until_settled(manager: &Manager) {
    loop {
        tokio::time::sleep(SETTLE_POLL).await;
        let stats = manager.statistics();
        if stats.active == 0 && stats.queued == 0 && manager.scheduler().entries().is_empty() {
            break;
        }
    }
}

fn short_name(url: &str) -> String {
    url.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}
