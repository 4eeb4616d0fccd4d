use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::AccessGuard;
use crate::channels::formatting::{format_duration, format_size, html_escape, sanitize_filename};
use crate::registry::{ActivateError, CreateError, DeclineError, PendingRegistry, Status};
use crate::traits::{Button, Notifier};
use crate::transfer::TransferRunner;
use crate::types::{callback_data, ButtonChoice, Event, FileAnnouncement, TransferOutcome};

/// The confirmation-gated download state machine. Consumes the single event
/// stream (transport events plus runner feedback), drives the registry and
/// runners, and emits outbound messages. Per-token transitions are linearized
/// because this loop is the only writer.
pub struct DownloadOrchestrator {
    guard: AccessGuard,
    registry: Arc<PendingRegistry>,
    runner: TransferRunner,
    notifier: Arc<dyn Notifier>,
    download_dir: PathBuf,
    max_concurrent: usize,
    pending_timeout: Option<Duration>,
    /// Confirmed tokens waiting for a free transfer slot, FIFO.
    deferred: VecDeque<String>,
    /// Activation instants, for the duration shown in completion reports.
    active_since: HashMap<String, Instant>,
}

impl DownloadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guard: AccessGuard,
        registry: Arc<PendingRegistry>,
        runner: TransferRunner,
        notifier: Arc<dyn Notifier>,
        download_dir: PathBuf,
        max_concurrent: usize,
        pending_timeout: Option<Duration>,
    ) -> Self {
        Self {
            guard,
            registry,
            runner,
            notifier,
            download_dir,
            max_concurrent: max_concurrent.max(1),
            pending_timeout,
            deferred: VecDeque::new(),
            active_since: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("Event channel closed, orchestrator stopping");
    }

    pub(crate) async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Announcement(announcement) => self.handle_announcement(announcement).await,
            Event::Button {
                sender_id,
                chat_id,
                token,
                choice,
            } => self.handle_button(sender_id, chat_id, &token, choice).await,
            Event::Progress {
                token,
                transferred,
                total,
            } => self.handle_progress(&token, transferred, total).await,
            Event::Finished { token, outcome } => self.handle_finished(&token, outcome).await,
            Event::SweepTick => self.sweep_stale_confirmations().await,
        }
    }

    async fn handle_announcement(&mut self, announcement: FileAnnouncement) {
        if !self
            .guard
            .authorize(announcement.sender_id, announcement.chat_id)
        {
            // Unauthorized senders learn nothing, not even a refusal.
            warn!(
                sender_id = announcement.sender_id,
                chat_id = announcement.chat_id,
                "Dropping announcement from unauthorized sender"
            );
            return;
        }

        let file_name = sanitize_filename(&announcement.file_name);
        let dest_path =
            unique_destination(&self.download_dir, &file_name, &self.registry).await;
        let token = announcement.token.clone();
        let chat_id = announcement.chat_id;
        let file_size = announcement.file_size;

        match self.registry.create(announcement, dest_path).await {
            Ok(()) => {}
            Err(CreateError::AlreadyExists) => {
                debug!(token = %token, "Duplicate announcement, ignoring");
                return;
            }
        }

        let text = format!(
            "Download this file?\n\n📄 <b>{}</b>\n💾 {}",
            html_escape(&file_name),
            format_size(file_size)
        );
        let buttons = vec![
            Button::new("Yes", callback_data(ButtonChoice::Confirm, &token)),
            Button::new("No", callback_data(ButtonChoice::Decline, &token)),
        ];
        match self.notifier.send_message(chat_id, &text, Some(buttons)).await {
            Ok(message_id) => {
                self.registry.set_prompt_message(&token, message_id).await;
                info!(token = %token, file = %file_name, "Awaiting confirmation");
            }
            Err(e) => {
                // Without a prompt the entry can never be confirmed; drop it.
                warn!(token = %token, "Could not send confirmation prompt: {}", e);
                self.registry
                    .resolve(&token, &TransferOutcome::Failed(e.to_string()))
                    .await;
            }
        }
    }

    async fn handle_button(
        &mut self,
        sender_id: u64,
        chat_id: i64,
        token: &str,
        choice: ButtonChoice,
    ) {
        if !self.guard.authorize(sender_id, chat_id) {
            warn!(sender_id, chat_id, "Dropping button press from unauthorized sender");
            return;
        }

        match choice {
            ButtonChoice::Confirm => self.handle_confirm(token).await,
            ButtonChoice::Decline => self.handle_decline(token).await,
            ButtonChoice::Cancel => {
                if self.registry.request_cancel(token).await {
                    info!(token = %token, "Cancellation requested");
                    self.edit_prompt(token, "🚫 Cancelling…", None).await;
                } else {
                    debug!(token = %token, "Cancel press for a token that is not downloading");
                }
            }
        }
    }

    async fn handle_confirm(&mut self, token: &str) {
        let in_progress = self.registry.in_progress_count().await;
        if in_progress >= self.max_concurrent {
            // Explicit backpressure: the entry stays AwaitingConfirmation and
            // is activated FIFO once a slot frees.
            match self.registry.get(token).await {
                Some(entry) if entry.status == Status::AwaitingConfirmation => {
                    if !self.deferred.iter().any(|t| t == token) {
                        self.deferred.push_back(token.to_string());
                        info!(token = %token, queue_len = self.deferred.len(), "Transfer queued");
                        self.edit_prompt(token, "⏳ Queued — waiting for a free download slot.", None)
                            .await;
                    }
                }
                _ => debug!(token = %token, "Stale confirmation, ignoring"),
            }
            return;
        }
        self.activate(token).await;
    }

    async fn activate(&mut self, token: &str) {
        match self.registry.try_activate(token).await {
            Ok((entry, cancel)) => {
                self.active_since.insert(token.to_string(), Instant::now());
                let name = entry.announcement.file_name.clone();
                info!(token = %token, file = %name, "Starting transfer");
                self.edit_prompt(
                    token,
                    &format!("⬇️ Downloading <b>{}</b>…", html_escape(&name)),
                    Some(vec![Button::new(
                        "Cancel",
                        callback_data(ButtonChoice::Cancel, token),
                    )]),
                )
                .await;
                self.runner.spawn(entry, cancel);
            }
            Err(ActivateError::AlreadyActive) | Err(ActivateError::NotFound) => {
                // Duplicate press or a press racing a completion; stay silent.
                debug!(token = %token, "Confirmation no-op");
            }
        }
    }

    async fn handle_decline(&mut self, token: &str) {
        match self.registry.decline(token).await {
            Ok(entry) => {
                self.deferred.retain(|t| t != token);
                info!(token = %token, file = %entry.announcement.file_name, "Download declined");
                if let Some(message_id) = entry.prompt_message_id {
                    self.edit(entry.announcement.chat_id, message_id, "🚫 Declined.", None)
                        .await;
                }
            }
            Err(DeclineError::NotFound) => {
                debug!(token = %token, "Decline no-op (already active or resolved)");
            }
        }
    }

    async fn handle_progress(&mut self, token: &str, transferred: u64, total: u64) {
        let Some(entry) = self.registry.get(token).await else {
            return; // transfer already resolved, stale report
        };
        if entry.status != Status::InProgress {
            return;
        }
        let name = html_escape(&entry.announcement.file_name);
        let text = if total > 0 {
            let pct = (transferred.saturating_mul(100) / total).min(100);
            format!(
                "⬇️ <b>{}</b> — {}% ({} / {})",
                name,
                pct,
                format_size(transferred),
                format_size(total)
            )
        } else {
            format!("⬇️ <b>{}</b> — {}", name, format_size(transferred))
        };
        if let Some(message_id) = entry.prompt_message_id {
            self.edit(
                entry.announcement.chat_id,
                message_id,
                &text,
                Some(vec![Button::new(
                    "Cancel",
                    callback_data(ButtonChoice::Cancel, token),
                )]),
            )
            .await;
        }
    }

    async fn handle_finished(&mut self, token: &str, outcome: TransferOutcome) {
        let elapsed = self.active_since.remove(token);
        let Some(entry) = self.registry.resolve(token, &outcome).await else {
            debug!(token = %token, "Outcome for an already-resolved token");
            self.fill_free_slots().await;
            return;
        };

        let chat_id = entry.announcement.chat_id;
        let name = html_escape(&entry.announcement.file_name);
        match outcome {
            TransferOutcome::Success(path) => {
                info!(token = %token, path = %path.display(), "Download complete");
                if let Some(message_id) = entry.prompt_message_id {
                    self.edit(chat_id, message_id, "✅ Download complete.", None).await;
                }
                let duration = elapsed
                    .map(|at| format_duration(at.elapsed().as_secs()))
                    .unwrap_or_else(|| "?".to_string());
                let text = format!(
                    "✅ <b>{}</b> saved to <code>{}</code>\n💾 {} • ⏱ {}",
                    name,
                    html_escape(&path.display().to_string()),
                    format_size(entry.announcement.file_size),
                    duration
                );
                self.send(chat_id, &text).await;
            }
            TransferOutcome::Failed(reason) => {
                warn!(token = %token, "Download failed: {}", reason);
                if let Some(message_id) = entry.prompt_message_id {
                    self.edit(chat_id, message_id, "⛔ Download failed.", None).await;
                }
                let text = format!(
                    "⛔ Failed to download <b>{}</b>.\n<code>{}</code>",
                    name,
                    html_escape(&reason)
                );
                self.send(chat_id, &text).await;
            }
            TransferOutcome::Cancelled => {
                info!(token = %token, "Download cancelled");
                if let Some(message_id) = entry.prompt_message_id {
                    self.edit(chat_id, message_id, "🚫 Cancelled.", None).await;
                }
                self.send(chat_id, &format!("🚫 Download of <b>{}</b> was cancelled.", name))
                    .await;
            }
        }

        self.fill_free_slots().await;
    }

    /// Activate deferred confirmations while transfer slots are free.
    async fn fill_free_slots(&mut self) {
        while self.registry.in_progress_count().await < self.max_concurrent {
            let Some(token) = self.deferred.pop_front() else {
                break;
            };
            self.activate(&token).await;
        }
    }

    /// Decline AwaitingConfirmation entries older than the configured
    /// threshold. Queued (already-confirmed) entries are exempt.
    async fn sweep_stale_confirmations(&mut self) {
        let Some(timeout) = self.pending_timeout else {
            return;
        };
        let now = chrono::Utc::now();
        for entry in self.registry.list().await {
            if entry.status != Status::AwaitingConfirmation {
                continue;
            }
            if self.deferred.iter().any(|t| t == &entry.token) {
                continue;
            }
            // Re-read through the registry: the snapshot above may be stale.
            let Some(since) = self.registry.pending_since(&entry.token).await else {
                continue;
            };
            let age = (now - since).to_std().unwrap_or(Duration::ZERO);
            if age < timeout {
                continue;
            }
            if self.registry.decline(&entry.token).await.is_ok() {
                info!(token = %entry.token, "Confirmation expired");
                if let Some(message_id) = entry.prompt_message_id {
                    self.edit(
                        entry.announcement.chat_id,
                        message_id,
                        "⌛ Confirmation expired.",
                        None,
                    )
                    .await;
                }
            }
        }
    }

    async fn edit_prompt(&self, token: &str, text: &str, buttons: Option<Vec<Button>>) {
        if let Some(entry) = self.registry.get(token).await {
            if let Some(message_id) = entry.prompt_message_id {
                self.edit(entry.announcement.chat_id, message_id, text, buttons)
                    .await;
            }
        }
    }

    async fn edit(&self, chat_id: i64, message_id: i32, text: &str, buttons: Option<Vec<Button>>) {
        if let Err(e) = self
            .notifier
            .edit_message(chat_id, message_id, text, buttons)
            .await
        {
            warn!(chat_id, message_id, "Could not edit status message: {}", e);
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.notifier.send_message(chat_id, text, None).await {
            warn!(chat_id, "Could not send notification: {}", e);
        }
    }
}

/// Pick a destination path under `dir` that collides neither with a file
/// already on disk nor with another live entry's destination:
/// "movie.mkv", "movie (1).mkv", "movie (2).mkv", …
pub(crate) async fn unique_destination(
    dir: &Path,
    file_name: &str,
    registry: &PendingRegistry,
) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() && !registry.dest_in_use(&candidate).await {
        return candidate;
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], &file_name[pos..]),
        _ => (file_name, ""),
    };
    for n in 1u32.. {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() && !registry.dest_in_use(&candidate).await {
            return candidate;
        }
    }
    unreachable!("counter space exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FetchStatus, Fetcher};
    use crate::transfer::RetryPolicy;
    use crate::types::FetchHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String, bool)>>,
        edits: Mutex<Vec<(i64, i32, String)>>,
        next_id: AtomicI32,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            buttons: Option<Vec<Button>>,
        ) -> anyhow::Result<i32> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id, text.to_string(), buttons.is_some()));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn edit_message(
            &self,
            chat_id: i64,
            message_id: i32,
            text: &str,
            _buttons: Option<Vec<Button>>,
        ) -> anyhow::Result<()> {
            self.edits
                .lock()
                .unwrap()
                .push((chat_id, message_id, text.to_string()));
            Ok(())
        }
    }

    impl RecordingNotifier {
        fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t, _)| t.clone()).collect()
        }

        fn edit_texts(&self) -> Vec<String> {
            self.edits.lock().unwrap().iter().map(|(_, _, t)| t.clone()).collect()
        }
    }

    /// Writes a small file immediately.
    struct InstantFetcher;

    #[async_trait]
    impl Fetcher for InstantFetcher {
        async fn fetch(
            &self,
            _handle: &FetchHandle,
            dest: &std::path::Path,
            on_chunk: &(dyn Fn(u64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> anyhow::Result<FetchStatus> {
            tokio::fs::write(dest, b"data").await?;
            on_chunk(4);
            Ok(FetchStatus::Complete(4))
        }
    }

    /// Counts calls, then parks until cancellation.
    #[derive(Default)]
    struct ParkedFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for ParkedFetcher {
        async fn fetch(
            &self,
            _handle: &FetchHandle,
            dest: &std::path::Path,
            _on_chunk: &(dyn Fn(u64) + Send + Sync),
            cancel: &CancellationToken,
        ) -> anyhow::Result<FetchStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"part").await?;
            cancel.cancelled().await;
            Ok(FetchStatus::Cancelled)
        }
    }

    /// Completes immediately, counting how often it was invoked.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(
            &self,
            _handle: &FetchHandle,
            dest: &std::path::Path,
            on_chunk: &(dyn Fn(u64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> anyhow::Result<FetchStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"data").await?;
            on_chunk(4);
            Ok(FetchStatus::Complete(4))
        }
    }

    /// Always errors.
    struct BrokenFetcher;

    #[async_trait]
    impl Fetcher for BrokenFetcher {
        async fn fetch(
            &self,
            _handle: &FetchHandle,
            _dest: &std::path::Path,
            _on_chunk: &(dyn Fn(u64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> anyhow::Result<FetchStatus> {
            anyhow::bail!("network reset")
        }
    }

    struct Harness {
        orchestrator: DownloadOrchestrator,
        events: mpsc::Receiver<Event>,
        notifier: Arc<RecordingNotifier>,
        registry: Arc<PendingRegistry>,
        dir: tempfile::TempDir,
    }

    fn harness_with(fetcher: Arc<dyn Fetcher>, max_concurrent: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PendingRegistry::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (tx, rx) = mpsc::channel(64);
        let runner = TransferRunner::new(
            fetcher,
            tx,
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            Duration::from_secs(3600), // progress edits are not under test here
        );
        let orchestrator = DownloadOrchestrator::new(
            AccessGuard::new(42, -100),
            Arc::clone(&registry),
            runner,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            dir.path().to_path_buf(),
            max_concurrent,
            Some(Duration::from_secs(600)),
        );
        Harness {
            orchestrator,
            events: rx,
            notifier,
            registry,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InstantFetcher), 2)
    }

    fn announcement(token: &str, name: &str) -> FileAnnouncement {
        FileAnnouncement {
            token: token.to_string(),
            sender_id: 42,
            chat_id: -100,
            file_name: name.to_string(),
            file_size: 5_000_000_000,
            handle: FetchHandle("file-id".to_string()),
        }
    }

    async fn next_finished(events: &mut mpsc::Receiver<Event>) -> Event {
        loop {
            match events.recv().await.expect("runner outcome") {
                e @ Event::Finished { .. } => return e,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn announcement_creates_prompt() {
        let mut h = harness();
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;

        let entry = h.registry.get("t1").await.unwrap();
        assert_eq!(entry.status, Status::AwaitingConfirmation);
        assert!(entry.prompt_message_id.is_some());

        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, -100);
        assert!(sent[0].1.contains("movie.mkv"));
        assert!(sent[0].2, "prompt must carry buttons");
    }

    #[tokio::test]
    async fn unauthorized_announcement_is_silent() {
        let mut h = harness();
        let mut ann = announcement("t1", "movie.mkv");
        ann.sender_id = 7;
        h.orchestrator.handle_event(Event::Announcement(ann)).await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_announcement_is_noop() {
        let mut h = harness();
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;

        assert_eq!(h.registry.list().await.len(), 1);
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn decline_removes_entry_and_creates_no_file() {
        let mut h = harness();
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Decline,
            })
            .await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h.notifier.edit_texts().iter().any(|t| t.contains("Declined")));
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn double_confirm_starts_exactly_one_transfer() {
        let fetcher = Arc::new(CountingFetcher::default());
        let mut h = harness_with(Arc::clone(&fetcher) as Arc<dyn Fetcher>, 2);
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;

        for _ in 0..2 {
            h.orchestrator
                .handle_event(Event::Button {
                    sender_id: 42,
                    chat_id: -100,
                    token: "t1".to_string(),
                    choice: ButtonChoice::Confirm,
                })
                .await;
        }

        let downloading_edits = h
            .notifier
            .edit_texts()
            .iter()
            .filter(|t| t.contains("Downloading"))
            .count();
        assert_eq!(downloading_edits, 1);

        // Exactly one runner reaches a terminal state.
        let finished = next_finished(&mut h.events).await;
        h.orchestrator.handle_event(finished).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(h.registry.get("t1").await.is_none());
        let terminal = h
            .notifier
            .sent_texts()
            .iter()
            .filter(|t| t.contains("saved to"))
            .count();
        assert_eq!(terminal, 1);
        // No second runner was spawned, so no second outcome is in flight.
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, Event::Finished { .. }));
        }
    }

    #[tokio::test]
    async fn unknown_token_press_is_silent() {
        let mut h = harness();
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t9".to_string(),
                choice: ButtonChoice::Confirm,
            })
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t9".to_string(),
                choice: ButtonChoice::Decline,
            })
            .await;

        assert!(h.notifier.sent.lock().unwrap().is_empty());
        assert!(h.notifier.edits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_transfer_notifies_and_removes_entry() {
        let mut h = harness();
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Confirm,
            })
            .await;

        let finished = next_finished(&mut h.events).await;
        h.orchestrator.handle_event(finished).await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h.dir.path().join("movie.mkv").exists());
        assert!(h
            .notifier
            .sent_texts()
            .iter()
            .any(|t| t.contains("saved to") && t.contains("movie.mkv")));
    }

    #[tokio::test]
    async fn failed_transfer_sends_error_notification() {
        let mut h = harness_with(Arc::new(BrokenFetcher), 2);
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Confirm,
            })
            .await;

        let finished = next_finished(&mut h.events).await;
        h.orchestrator.handle_event(finished).await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h
            .notifier
            .sent_texts()
            .iter()
            .any(|t| t.contains("Failed") && t.contains("network reset")));
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn excess_confirmations_queue_until_a_slot_frees() {
        let fetcher = Arc::new(ParkedFetcher::default());
        let mut h = harness_with(Arc::clone(&fetcher) as Arc<dyn Fetcher>, 1);
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "one.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t2", "two.mkv")))
            .await;

        for token in ["t1", "t2"] {
            h.orchestrator
                .handle_event(Event::Button {
                    sender_id: 42,
                    chat_id: -100,
                    token: token.to_string(),
                    choice: ButtonChoice::Confirm,
                })
                .await;
        }

        assert_eq!(h.registry.get("t1").await.unwrap().status, Status::InProgress);
        assert_eq!(
            h.registry.get("t2").await.unwrap().status,
            Status::AwaitingConfirmation
        );
        assert!(h.notifier.edit_texts().iter().any(|t| t.contains("Queued")));

        // Cancel the first transfer; its slot goes to t2.
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Cancel,
            })
            .await;
        let finished = next_finished(&mut h.events).await;
        h.orchestrator.handle_event(finished).await;

        assert!(h.registry.get("t1").await.is_none());
        assert_eq!(h.registry.get("t2").await.unwrap().status, Status::InProgress);
    }

    #[tokio::test]
    async fn cancelled_transfer_cleans_up_and_notifies() {
        let fetcher = Arc::new(ParkedFetcher::default());
        let mut h = harness_with(Arc::clone(&fetcher) as Arc<dyn Fetcher>, 2);
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Confirm,
            })
            .await;
        h.orchestrator
            .handle_event(Event::Button {
                sender_id: 42,
                chat_id: -100,
                token: "t1".to_string(),
                choice: ButtonChoice::Cancel,
            })
            .await;

        let finished = next_finished(&mut h.events).await;
        h.orchestrator.handle_event(finished).await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h.notifier.sent_texts().iter().any(|t| t.contains("cancelled")));
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn stale_confirmations_expire_on_sweep() {
        let mut h = harness();
        h.orchestrator.pending_timeout = Some(Duration::ZERO);
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;

        h.orchestrator.handle_event(Event::SweepTick).await;

        assert!(h.registry.get("t1").await.is_none());
        assert!(h.notifier.edit_texts().iter().any(|t| t.contains("expired")));
    }

    #[tokio::test]
    async fn destinations_are_collision_adjusted() {
        let mut h = harness();
        std::fs::write(h.dir.path().join("movie.mkv"), b"existing").unwrap();

        h.orchestrator
            .handle_event(Event::Announcement(announcement("t1", "movie.mkv")))
            .await;
        h.orchestrator
            .handle_event(Event::Announcement(announcement("t2", "movie.mkv")))
            .await;

        assert_eq!(
            h.registry.get("t1").await.unwrap().dest_path,
            h.dir.path().join("movie (1).mkv")
        );
        assert_eq!(
            h.registry.get("t2").await.unwrap().dest_path,
            h.dir.path().join("movie (2).mkv")
        );
    }
}
