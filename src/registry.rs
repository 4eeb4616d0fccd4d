use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::types::{FileAnnouncement, TransferOutcome};

/// Lifecycle state of one announced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    AwaitingConfirmation,
    InProgress,
    Completed,
    Declined,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::AwaitingConfirmation => write!(f, "awaiting confirmation"),
            Status::InProgress => write!(f, "downloading"),
            Status::Completed => write!(f, "completed"),
            Status::Declined => write!(f, "declined"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// One awaiting-confirmation or in-progress transfer. Owned exclusively by
/// the registry; callers get clones and may only mutate through registry
/// methods.
#[derive(Debug, Clone)]
pub struct PendingDownload {
    pub token: String,
    pub announcement: FileAnnouncement,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub dest_path: PathBuf,
    pub prompt_message_id: Option<i32>,
}

struct PendingHandle {
    entry: PendingDownload,
    cancel: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateError {
    /// A live entry for this token already exists (duplicate delivery).
    AlreadyExists,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ActivateError {
    /// Token already removed (resolved or timed out).
    NotFound,
    /// Entry is already in progress — duplicate confirmation press.
    AlreadyActive,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeclineError {
    /// Token unknown, already removed, or no longer awaiting confirmation.
    NotFound,
}

/// Maps correlation tokens to pending downloads. All mutations on a given
/// token go through the write lock, so no two can be observed as happening
/// at once — this is what makes double-clicking "Yes" or racing a decline
/// against a completion safe.
pub struct PendingRegistry {
    entries: RwLock<HashMap<String, PendingHandle>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new awaiting-confirmation entry. Duplicate announcement
    /// delivery yields `AlreadyExists`; callers treat that as a no-op.
    pub async fn create(
        &self,
        announcement: FileAnnouncement,
        dest_path: PathBuf,
    ) -> Result<(), CreateError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&announcement.token) {
            return Err(CreateError::AlreadyExists);
        }
        let token = announcement.token.clone();
        let handle = PendingHandle {
            entry: PendingDownload {
                token: token.clone(),
                announcement,
                status: Status::AwaitingConfirmation,
                created_at: Utc::now(),
                dest_path,
                prompt_message_id: None,
            },
            cancel: CancellationToken::new(),
        };
        entries.insert(token, handle);
        Ok(())
    }

    /// Record the message id of the confirmation prompt so later status
    /// edits can target it.
    pub async fn set_prompt_message(&self, token: &str, message_id: i32) {
        let mut entries = self.entries.write().await;
        if let Some(handle) = entries.get_mut(token) {
            handle.entry.prompt_message_id = Some(message_id);
        }
    }

    /// Atomically transition AwaitingConfirmation -> InProgress and return a
    /// snapshot plus the cancellation token the runner should watch.
    /// A second confirmation press lands on `AlreadyActive` and must stay a
    /// silent no-op upstream.
    pub async fn try_activate(
        &self,
        token: &str,
    ) -> Result<(PendingDownload, CancellationToken), ActivateError> {
        let mut entries = self.entries.write().await;
        let handle = entries.get_mut(token).ok_or(ActivateError::NotFound)?;
        if handle.entry.status != Status::AwaitingConfirmation {
            return Err(ActivateError::AlreadyActive);
        }
        handle.entry.status = Status::InProgress;
        Ok((handle.entry.clone(), handle.cancel.clone()))
    }

    /// AwaitingConfirmation -> Declined, removing the entry. Declining an
    /// already-activated or vanished entry is `NotFound` — never a silent
    /// re-decline of an in-progress transfer.
    pub async fn decline(&self, token: &str) -> Result<PendingDownload, DeclineError> {
        let mut entries = self.entries.write().await;
        match entries.get(token).map(|h| h.entry.status) {
            Some(Status::AwaitingConfirmation) => {
                let mut handle = entries.remove(token).ok_or(DeclineError::NotFound)?;
                handle.entry.status = Status::Declined;
                Ok(handle.entry)
            }
            _ => Err(DeclineError::NotFound),
        }
    }

    /// Mark a terminal state and remove the entry. Idempotent: resolving an
    /// already-removed token returns None.
    pub async fn resolve(&self, token: &str, outcome: &TransferOutcome) -> Option<PendingDownload> {
        let mut entries = self.entries.write().await;
        let mut handle = entries.remove(token)?;
        handle.entry.status = match outcome {
            TransferOutcome::Success(_) => Status::Completed,
            TransferOutcome::Failed(_) => Status::Failed,
            // Cancelled entries are simply removed; there is no user-visible
            // terminal status beyond the notification.
            TransferOutcome::Cancelled => Status::Failed,
        };
        Some(handle.entry)
    }

    /// Fire the cancellation token of an in-progress entry. Returns false
    /// for unknown tokens or entries that are not downloading.
    pub async fn request_cancel(&self, token: &str) -> bool {
        let entries = self.entries.read().await;
        match entries.get(token) {
            Some(h) if h.entry.status == Status::InProgress => {
                h.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Creation time of a live entry, used by the timeout sweep.
    pub async fn pending_since(&self, token: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries.get(token).map(|h| h.entry.created_at)
    }

    pub async fn get(&self, token: &str) -> Option<PendingDownload> {
        let entries = self.entries.read().await;
        entries.get(token).map(|h| h.entry.clone())
    }

    /// Snapshot of all live entries, sorted by creation time.
    pub async fn list(&self) -> Vec<PendingDownload> {
        let entries = self.entries.read().await;
        let mut all: Vec<PendingDownload> = entries.values().map(|h| h.entry.clone()).collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    pub async fn in_progress_count(&self) -> usize {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|h| h.entry.status == Status::InProgress)
            .count()
    }

    /// Whether any live entry already claims this destination path. Feeds
    /// collision adjustment for files that are announced but not yet on disk.
    pub async fn dest_in_use(&self, path: &Path) -> bool {
        let entries = self.entries.read().await;
        entries.values().any(|h| h.entry.dest_path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchHandle;

    fn announcement(token: &str) -> FileAnnouncement {
        FileAnnouncement {
            token: token.to_string(),
            sender_id: 1,
            chat_id: 1,
            file_name: "movie.mkv".to_string(),
            file_size: 5_000_000_000,
            handle: FetchHandle("file-id".to_string()),
        }
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();
        let err = registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap_err();
        assert_eq!(err, CreateError::AlreadyExists);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn double_activation_is_rejected() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();

        let (entry, _cancel) = registry.try_activate("t1").await.unwrap();
        assert_eq!(entry.status, Status::InProgress);
        assert_eq!(
            registry.try_activate("t1").await.unwrap_err(),
            ActivateError::AlreadyActive
        );
    }

    #[tokio::test]
    async fn activate_unknown_token_is_not_found() {
        let registry = PendingRegistry::new();
        assert_eq!(
            registry.try_activate("t9").await.unwrap_err(),
            ActivateError::NotFound
        );
    }

    #[tokio::test]
    async fn decline_removes_the_entry() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();

        let entry = registry.decline("t1").await.unwrap();
        assert_eq!(entry.status, Status::Declined);
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.decline("t1").await.unwrap_err(), DeclineError::NotFound);
    }

    #[tokio::test]
    async fn decline_after_activation_is_not_found() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();
        registry.try_activate("t1").await.unwrap();

        assert_eq!(registry.decline("t1").await.unwrap_err(), DeclineError::NotFound);
        // The in-progress entry is untouched.
        assert_eq!(registry.get("t1").await.unwrap().status, Status::InProgress);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();
        registry.try_activate("t1").await.unwrap();

        let outcome = TransferOutcome::Success(PathBuf::from("/tmp/movie.mkv"));
        assert!(registry.resolve("t1", &outcome).await.is_some());
        assert!(registry.resolve("t1", &outcome).await.is_none());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_only_fires_for_in_progress_entries() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();
        assert!(!registry.request_cancel("t1").await);
        assert!(!registry.request_cancel("t9").await);

        let (_, cancel) = registry.try_activate("t1").await.unwrap();
        assert!(registry.request_cancel("t1").await);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn dest_in_use_sees_live_entries() {
        let registry = PendingRegistry::new();
        registry
            .create(announcement("t1"), PathBuf::from("/tmp/movie.mkv"))
            .await
            .unwrap();
        assert!(registry.dest_in_use(Path::new("/tmp/movie.mkv")).await);
        assert!(!registry.dest_in_use(Path::new("/tmp/other.mkv")).await);
    }
}
