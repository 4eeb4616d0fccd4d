use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teloxide::Bot;
use tracing::info;

use crate::access::AccessGuard;
use crate::channels::{TelegramChannel, TelegramFetcher, TelegramNotifier};
use crate::config::AppConfig;
use crate::orchestrator::DownloadOrchestrator;
use crate::registry::PendingRegistry;
use crate::transfer::{RetryPolicy, TransferRunner};
use crate::types::Event;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Destination directory
    let download_dir = PathBuf::from(&config.downloads.dir);
    tokio::fs::create_dir_all(&download_dir).await?;
    info!(dir = %download_dir.display(), "Download directory ready");

    // 2. Bot client (optionally against a self-hosted Bot API server)
    let mut bot = Bot::new(&config.telegram.bot_token);
    let api_base = match &config.telegram.api_url {
        Some(url) => {
            bot = bot.set_api_url(reqwest::Url::parse(url)?);
            info!(api_url = %url, "Using self-hosted Bot API server");
            url.clone()
        }
        None => DEFAULT_API_BASE.to_string(),
    };

    // 3. Access guard and registry
    let guard = AccessGuard::new(config.telegram.owner_user_id, config.telegram.chat_id);
    let registry = Arc::new(PendingRegistry::new());

    // 4. Orchestrator event loop
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<Event>(64);
    let notifier = Arc::new(TelegramNotifier::new(bot.clone()));
    let fetcher = Arc::new(TelegramFetcher::new(
        bot.clone(),
        config.telegram.bot_token.clone(),
        api_base,
    ));
    let runner = TransferRunner::new(
        fetcher,
        event_tx.clone(),
        RetryPolicy {
            max_attempts: config.downloads.max_attempts,
            initial_backoff: Duration::from_secs(config.downloads.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.downloads.max_backoff_secs),
        },
        Duration::from_secs(config.downloads.progress_interval_secs),
    );
    let pending_timeout = match config.downloads.pending_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let orchestrator = DownloadOrchestrator::new(
        guard,
        Arc::clone(&registry),
        runner,
        notifier,
        download_dir.clone(),
        config.downloads.max_concurrent,
        pending_timeout,
    );
    tokio::spawn(orchestrator.run(event_rx));

    // 5. Periodic sweep of stale confirmation prompts
    if pending_timeout.is_some() {
        let sweep_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if sweep_tx.send(Event::SweepTick).await.is_err() {
                    break;
                }
            }
        });
    }

    // 6. Telegram channel with auto-retry (blocks)
    let channel = Arc::new(TelegramChannel::new(
        bot,
        guard,
        registry,
        event_tx,
        download_dir,
    ));
    info!("Starting telefetch v{}", env!("CARGO_PKG_VERSION"));
    channel.start_with_retry().await;

    Ok(())
}
