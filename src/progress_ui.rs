//! Progress bars driven by the engine's progress feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use splitfetch_core::{ProgressEvent, TaskId, TaskState};
use tokio::sync::broadcast::{self, error::RecvError};

const BAR_TEMPLATE: &str =
    "{spinner} {prefix:20!} [{bar:30}] {bytes}/{total_bytes} {binary_bytes_per_sec} {msg}";

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: broadcast::Receiver<ProgressEvent>,
    names: HashMap<TaskId, String>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(render(events, names, Arc::clone(&stop)));
    (Some(handle), stop)
}

async fn render(
    mut events: broadcast::Receiver<ProgressEvent>,
    names: HashMap<TaskId, String>,
    stop: Arc<AtomicBool>,
) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(Duration::from_millis(120), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(_))) | Err(_) => continue,
            Ok(Err(RecvError::Closed)) => break,
        };

        let bar = bars.entry(event.task_id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_prefix(
                names
                    .get(&event.task_id)
                    .cloned()
                    .unwrap_or_else(|| event.task_id.to_string()),
            );
            bar
        });
        update_bar(bar, &event);
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}

fn update_bar(bar: &ProgressBar, event: &ProgressEvent) {
    if let Some(total) = event.total_size {
        bar.set_length(total);
    }
    bar.set_position(event.bytes_downloaded);

    match event.state {
        TaskState::Completed => {
            bar.finish_with_message(format!("done ({})", HumanBytes(event.bytes_downloaded)));
        }
        TaskState::Failed => {
            let reason = event
                .error
                .as_ref()
                .map_or_else(|| "failed".to_string(), |e| format!("failed: {}", e.kind));
            bar.abandon_with_message(reason);
        }
        TaskState::Canceled => bar.abandon_with_message("canceled"),
        state => {
            let eta = event
                .eta
                .map(|eta| format!(" eta {}s", eta.as_secs()))
                .unwrap_or_default();
            bar.set_message(format!("{state}{eta}"));
        }
    }
}
