use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::FetchHandle;

/// One inline button: label shown to the user, opaque data echoed back on
/// press (see `types::callback_data`).
#[derive(Debug, Clone)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: &str, data: String) -> Self {
        Self {
            label: label.to_string(),
            data,
        }
    }
}

/// Outbound side of the transport: plain-text (HTML-escaped upstream)
/// messages and in-place edits, optionally carrying one row of buttons.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a message, returning the transport's message id for later edits.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Option<Vec<Button>>,
    ) -> anyhow::Result<i32>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        buttons: Option<Vec<Button>>,
    ) -> anyhow::Result<()>;
}

/// Result of one fetch attempt that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// All bytes written to the destination; total byte count.
    Complete(u64),
    /// The cancellation token fired between chunks; the fetch stopped early.
    Cancelled,
}

/// The external byte-transfer primitive. Implementations stream the remote
/// handle's bytes to `dest`, invoking `on_chunk` with the cumulative byte
/// count and checking `cancel` between chunks. Transient failures surface as
/// errors; retry policy lives in the runner, not here.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        handle: &FetchHandle,
        dest: &Path,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> anyhow::Result<FetchStatus>;
}
