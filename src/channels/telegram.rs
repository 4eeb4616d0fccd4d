use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, MessageId, ParseMode,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::formatting::{format_size, html_escape};
use crate::access::AccessGuard;
use crate::registry::PendingRegistry;
use crate::traits::{Button, FetchStatus, Fetcher, Notifier};
use crate::types::{parse_callback_data, Event, FetchHandle, FileAnnouncement};

/// Inbound side of the Telegram transport: converts messages and callback
/// queries into orchestrator events, and answers the handful of operator
/// commands (/status, /storage, …) directly.
pub struct TelegramChannel {
    bot: Bot,
    guard: AccessGuard,
    registry: Arc<PendingRegistry>,
    events: tokio::sync::mpsc::Sender<Event>,
    download_dir: PathBuf,
}

impl TelegramChannel {
    pub fn new(
        bot: Bot,
        guard: AccessGuard,
        registry: Arc<PendingRegistry>,
        events: tokio::sync::mpsc::Sender<Event>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            bot,
            guard,
            registry,
            events,
            download_dir,
        }
    }

    /// Start the dispatcher with automatic retry on crash.
    /// Exponential backoff 5s → 60s cap, reset after a stable run.
    pub async fn start_with_retry(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        loop {
            info!("Starting Telegram dispatcher");
            let started = tokio::time::Instant::now();
            self.clone().start().await;
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Telegram dispatcher stopped, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    pub async fn start(self: Arc<Self>) {
        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint({
                let channel = Arc::clone(&self);
                move |msg: Message, bot: Bot| {
                    let channel = Arc::clone(&channel);
                    async move {
                        channel.handle_message(msg, bot).await;
                        respond(())
                    }
                }
            }))
            .branch(Update::filter_callback_query().endpoint({
                let channel = Arc::clone(&self);
                move |q: CallbackQuery, bot: Bot| {
                    let channel = Arc::clone(&channel);
                    async move {
                        channel.handle_callback(q, bot).await;
                        respond(())
                    }
                }
            }));

        Dispatcher::builder(self.bot.clone(), handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    async fn handle_message(&self, msg: Message, bot: Bot) {
        let sender_id = msg.from.as_ref().map(|u| u.id.0).unwrap_or(0);
        let chat_id = msg.chat.id.0;

        if let Some((file_id, file_size, file_name)) = extract_file(&msg) {
            // Authorization is the orchestrator's job; the channel only
            // translates. The correlation token is the announcing message's
            // identity, so transport redelivery dedupes in the registry.
            let announcement = FileAnnouncement {
                token: msg.id.0.to_string(),
                sender_id,
                chat_id,
                file_name,
                file_size,
                handle: FetchHandle(file_id),
            };
            if self
                .events
                .send(Event::Announcement(announcement))
                .await
                .is_err()
            {
                warn!("Event channel closed, dropping announcement");
            }
            return;
        }

        if let Some(text) = msg.text() {
            if text.starts_with('/') {
                self.handle_command(text, &msg, &bot).await;
                return;
            }
        }

        // Plain text or unsupported media: nudge the operator, stay silent
        // toward everyone else.
        if self.guard.authorize(sender_id, chat_id) {
            let _ = bot
                .send_message(
                    msg.chat.id,
                    "Send me a file and I'll download it for you. /help",
                )
                .await;
        } else {
            debug!(sender_id, chat_id, "Ignoring message from unauthorized sender");
        }
    }

    /// Callback queries carry the button's data string. The press is
    /// acknowledged immediately (stops the client spinner) and forwarded;
    /// the orchestrator decides whether it is live, duplicate, or stale.
    async fn handle_callback(&self, q: CallbackQuery, bot: Bot) {
        let _ = bot.answer_callback_query(q.id.clone()).await;

        let Some(data) = q.data.as_deref() else {
            return;
        };
        let Some((choice, token)) = parse_callback_data(data) else {
            return;
        };
        let Some(MaybeInaccessibleMessage::Regular(message)) = q.message else {
            debug!("Callback without an accessible message, dropping");
            return;
        };

        let event = Event::Button {
            sender_id: q.from.id.0,
            chat_id: message.chat.id.0,
            token: token.to_string(),
            choice,
        };
        if self.events.send(event).await.is_err() {
            warn!("Event channel closed, dropping button press");
        }
    }

    async fn handle_command(&self, text: &str, msg: &Message, bot: &Bot) {
        let sender_id = msg.from.as_ref().map(|u| u.id.0).unwrap_or(0);
        if !self.guard.authorize(sender_id, msg.chat.id.0) {
            warn!(sender_id, "Ignoring command from unauthorized sender");
            return;
        }

        let cmd = text.split_whitespace().next().unwrap_or(text);
        let reply = match cmd {
            "/start" | "/help" => format!(
                "I download the files you send me, after you confirm each one.\n\n\
                 /help — this message\n\
                 /info — your user and chat ids\n\
                 /status — pending and active downloads\n\
                 /storage — disk space in the download folder\n\
                 /ip — this machine's local IP address\n\n\
                 Files are saved to <code>{}</code>.",
                html_escape(&self.download_dir.display().to_string())
            ),
            "/info" => format!(
                "User ID: <code>{}</code>\nChat ID: <code>{}</code>",
                sender_id, msg.chat.id.0
            ),
            "/status" => self.status_report().await,
            "/storage" => storage_report(&self.download_dir),
            "/ip" => ip_report(),
            _ => format!(
                "Unknown command: {}\nType /help for available commands.",
                html_escape(cmd)
            ),
        };

        let _ = bot
            .send_message(msg.chat.id, reply)
            .parse_mode(ParseMode::Html)
            .await;
    }

    async fn status_report(&self) -> String {
        let entries = self.registry.list().await;
        if entries.is_empty() {
            return "No downloads at the moment.".to_string();
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|e| {
                let elapsed = (Utc::now() - e.created_at).num_seconds().max(0) as u64;
                format!(
                    "📄 <b>{}</b> — {} — {} ({})",
                    html_escape(&e.announcement.file_name),
                    format_size(e.announcement.file_size),
                    e.status,
                    super::formatting::format_duration(elapsed)
                )
            })
            .collect();
        format!("<b>Downloads</b>\n\n{}", lines.join("\n"))
    }
}

/// Extract (file id, declared size, declared name) from a file-bearing
/// message. Documents, videos and audio are file-bearing; everything else
/// is not.
fn extract_file(msg: &Message) -> Option<(String, u64, String)> {
    if let Some(doc) = msg.document() {
        return Some((
            doc.file.id.clone(),
            doc.file.size as u64,
            doc.file_name
                .clone()
                .unwrap_or_else(|| "document".to_string()),
        ));
    }
    if let Some(video) = msg.video() {
        return Some((
            video.file.id.clone(),
            video.file.size as u64,
            video
                .file_name
                .clone()
                .unwrap_or_else(|| "video.mp4".to_string()),
        ));
    }
    if let Some(audio) = msg.audio() {
        return Some((
            audio.file.id.clone(),
            audio.file.size as u64,
            audio
                .file_name
                .clone()
                .unwrap_or_else(|| "audio.mp3".to_string()),
        ));
    }
    None
}

fn storage_report(dir: &std::path::Path) -> String {
    match (fs2::total_space(dir), fs2::available_space(dir)) {
        (Ok(total), Ok(free)) => {
            let used = total.saturating_sub(free);
            format!(
                "📂 <code>{}</code>\n🟣 Total: {}\n🟠 Used: {}\n🟢 Free: {}",
                html_escape(&dir.display().to_string()),
                format_size(total),
                format_size(used),
                format_size(free)
            )
        }
        _ => "The download folder does not exist.".to_string(),
    }
}

fn ip_report() -> String {
    match local_ip() {
        Some(ip) => format!("Your IP address is: <code>{}</code>", ip),
        None => "Failed to determine the local IP address.".to_string(),
    }
}

/// Discover the outward-facing local address by routing a UDP socket toward
/// a public resolver. No packet is sent; connect() only consults the routing
/// table.
fn local_ip() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

/// Outbound transport: HTML messages with optional one-row inline keyboards.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn keyboard(buttons: Vec<Button>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![buttons
        .into_iter()
        .map(|b| InlineKeyboardButton::callback(b.label, b.data))
        .collect::<Vec<_>>()])
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Option<Vec<Button>>,
    ) -> anyhow::Result<i32> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(buttons) = buttons {
            request = request.reply_markup(keyboard(buttons));
        }
        let message = request.await?;
        Ok(message.id.0)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        buttons: Option<Vec<Button>>,
    ) -> anyhow::Result<()> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(buttons) = buttons {
            request = request.reply_markup(keyboard(buttons));
        }
        request.await?;
        Ok(())
    }
}

/// The fetch primitive: resolves the file id through getFile, then streams
/// the bytes over HTTP chunk by chunk so progress and cancellation are
/// observable mid-transfer. Works against api.telegram.org or a self-hosted
/// Bot API server (`telegram.api_url`), which lifts the 20 MB bot limit.
pub struct TelegramFetcher {
    bot: Bot,
    bot_token: String,
    api_base: String,
}

impl TelegramFetcher {
    pub fn new(bot: Bot, bot_token: String, api_base: String) -> Self {
        Self {
            bot,
            bot_token,
            api_base,
        }
    }
}

#[async_trait]
impl Fetcher for TelegramFetcher {
    async fn fetch(
        &self,
        handle: &FetchHandle,
        dest: &std::path::Path,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> anyhow::Result<FetchStatus> {
        let file = self.bot.get_file(handle.0.clone()).await?;
        let url = format!(
            "{}/file/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.bot_token,
            file.path
        );

        let response = reqwest::get(&url).await?;
        if !response.status().is_success() {
            anyhow::bail!("file endpoint returned HTTP {}", response.status());
        }

        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(FetchStatus::Cancelled);
            }
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_chunk(written);
        }
        out.flush().await?;
        Ok(FetchStatus::Complete(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_report_is_well_formed() {
        // local_ip is environment-dependent; both branches must produce a
        // sendable reply and never panic.
        let report = ip_report();
        assert!(
            report.starts_with("Your IP address is:") || report.starts_with("Failed"),
            "unexpected /ip reply: {report}"
        );
        if let Some(ip) = local_ip() {
            assert!(!ip.is_unspecified());
        }
    }
}
