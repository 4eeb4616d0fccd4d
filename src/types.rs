use std::path::PathBuf;

/// Opaque transport handle used to fetch a file's bytes (Telegram file id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchHandle(pub String);

/// Immutable description of an inbound file-bearing message.
#[derive(Debug, Clone)]
pub struct FileAnnouncement {
    /// Correlation token, derived from the transport's message identity.
    pub token: String,
    pub sender_id: u64,
    pub chat_id: i64,
    pub file_name: String,
    pub file_size: u64,
    pub handle: FetchHandle,
}

/// Which inline button the user pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonChoice {
    Confirm,
    Decline,
    Cancel,
}

/// Terminal outcome of one transfer, delivered exactly once per runner.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Success(PathBuf),
    Failed(String),
    Cancelled,
}

/// Everything the orchestrator's single event loop consumes. Inbound
/// transport events and runner feedback share one channel so all registry
/// mutations flow through one consumer.
#[derive(Debug)]
pub enum Event {
    Announcement(FileAnnouncement),
    Button {
        sender_id: u64,
        chat_id: i64,
        token: String,
        choice: ButtonChoice,
    },
    Progress {
        token: String,
        transferred: u64,
        total: u64,
    },
    Finished {
        token: String,
        outcome: TransferOutcome,
    },
    SweepTick,
}

/// Build the callback data string carried by an inline button.
pub fn callback_data(choice: ButtonChoice, token: &str) -> String {
    let action = match choice {
        ButtonChoice::Confirm => "yes",
        ButtonChoice::Decline => "no",
        ButtonChoice::Cancel => "cancel",
    };
    format!("dl:{}:{}", action, token)
}

/// Parse callback data back into a choice and token. Returns None for
/// anything that did not come from one of our keyboards.
pub fn parse_callback_data(data: &str) -> Option<(ButtonChoice, &str)> {
    let mut parts = data.splitn(3, ':');
    if parts.next() != Some("dl") {
        return None;
    }
    let choice = match parts.next()? {
        "yes" => ButtonChoice::Confirm,
        "no" => ButtonChoice::Decline,
        "cancel" => ButtonChoice::Cancel,
        _ => return None,
    };
    let token = parts.next()?;
    if token.is_empty() {
        return None;
    }
    Some((choice, token))
}
