use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::PendingDownload;
use crate::traits::{FetchStatus, Fetcher};
use crate::types::{Event, TransferOutcome};

/// Bounded-retry policy for transient fetch errors.
/// Backoff doubles per attempt up to the cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

/// Drives one file transfer to completion as an independent tokio task.
/// Streams to a temporary `.part` file colocated with the destination, then
/// atomically renames on success so a partially-written file never appears
/// under the final name. All outcomes are delivered through the shared event
/// channel; nothing escapes past this boundary.
pub struct TransferRunner {
    fetcher: Arc<dyn Fetcher>,
    events: mpsc::Sender<Event>,
    retry: RetryPolicy,
    progress_interval: Duration,
}

impl TransferRunner {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        events: mpsc::Sender<Event>,
        retry: RetryPolicy,
        progress_interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            events,
            retry,
            progress_interval,
        }
    }

    pub fn spawn(&self, pending: PendingDownload, cancel: CancellationToken) {
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let retry = self.retry.clone();
        let progress_interval = self.progress_interval;
        tokio::spawn(async move {
            let token = pending.token.clone();
            let outcome =
                perform_transfer(fetcher, &events, retry, progress_interval, pending, cancel).await;
            if events.send(Event::Finished { token, outcome }).await.is_err() {
                debug!("Event channel closed before transfer outcome could be delivered");
            }
        });
    }
}

async fn perform_transfer(
    fetcher: Arc<dyn Fetcher>,
    events: &mpsc::Sender<Event>,
    retry: RetryPolicy,
    progress_interval: Duration,
    pending: PendingDownload,
    cancel: CancellationToken,
) -> TransferOutcome {
    let temp = temp_path(&pending.dest_path);
    let token = pending.token.clone();
    let total = pending.announcement.file_size;

    // Rate limit progress reports so a fast transfer does not flood the
    // outbound channel. try_send drops reports when the loop is busy.
    let last_report: Mutex<Option<Instant>> = Mutex::new(None);
    let progress_events = events.clone();
    let progress_token = token.clone();
    let on_chunk = move |transferred: u64| {
        let mut last = last_report.lock().unwrap_or_else(|p| p.into_inner());
        let due = match *last {
            Some(at) => at.elapsed() >= progress_interval,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
            let _ = progress_events.try_send(Event::Progress {
                token: progress_token.clone(),
                transferred,
                total,
            });
        }
    };

    let mut backoff = retry.initial_backoff;
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=retry.max_attempts.max(1) {
        if cancel.is_cancelled() {
            remove_temp(&temp).await;
            return TransferOutcome::Cancelled;
        }

        match fetcher
            .fetch(&pending.announcement.handle, &temp, &on_chunk, &cancel)
            .await
        {
            Ok(FetchStatus::Complete(bytes)) => {
                debug!(token = %token, bytes, "Fetch complete, moving into place");
                match finalize(&temp, &pending.dest_path).await {
                    Ok(()) => return TransferOutcome::Success(pending.dest_path.clone()),
                    Err(e) => {
                        // A rename failure is not transient; do not retry.
                        remove_temp(&temp).await;
                        return TransferOutcome::Failed(format!(
                            "could not move file into place: {}",
                            e
                        ));
                    }
                }
            }
            Ok(FetchStatus::Cancelled) => {
                remove_temp(&temp).await;
                return TransferOutcome::Cancelled;
            }
            Err(e) => {
                last_error = e.to_string();
                remove_temp(&temp).await;
                if attempt < retry.max_attempts {
                    warn!(
                        token = %token,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "Fetch failed, retrying: {}",
                        last_error
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return TransferOutcome::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, retry.max_backoff);
                }
            }
        }
    }

    TransferOutcome::Failed(last_error)
}

/// Hidden sibling of the destination, unique per transfer so concurrent
/// runners sharing a directory never collide.
fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}.{}.part", name, suffix))
}

async fn finalize(temp: &Path, dest: &Path) -> anyhow::Result<()> {
    tokio::fs::rename(temp, dest).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o664));
    }
    Ok(())
}

async fn remove_temp(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(temp = %temp.display(), "Could not remove temporary file: {}", e);
        }
    }
}
