use serde::Deserialize;
use std::path::Path;

/// Loaded from config.toml at startup. Anything invalid or missing here is
/// fatal: the process refuses to start rather than limping into a runtime
/// error path.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Bot token; may also come from the TELEFETCH_BOT_TOKEN environment
    /// variable (a .env file is honored), which takes precedence.
    #[serde(default)]
    pub bot_token: String,
    /// The one authorized operator.
    pub owner_user_id: u64,
    /// The one authorized chat.
    pub chat_id: i64,
    /// Optional self-hosted Bot API server, e.g. "http://localhost:8081".
    /// Needed for files above Telegram's hosted 20 MB bot limit.
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadsConfig {
    #[serde(default = "default_dir")]
    pub dir: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Minimum seconds between progress edits per transfer.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Unconfirmed prompts older than this are expired. 0 disables the sweep.
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            progress_interval_secs: default_progress_interval_secs(),
            pending_timeout_secs: default_pending_timeout_secs(),
        }
    }
}

fn default_dir() -> String {
    "downloads".to_string()
}
fn default_max_concurrent() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_secs() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_progress_interval_secs() -> u64 {
    5
}
fn default_pending_timeout_secs() -> u64 {
    900
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("could not read {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig = toml::from_str(content)?;
        if let Ok(token) = std::env::var("TELEFETCH_BOT_TOKEN") {
            if !token.is_empty() {
                config.telegram.bot_token = token;
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.is_empty() {
            anyhow::bail!("telegram.bot_token is not set (config.toml or TELEFETCH_BOT_TOKEN)");
        }
        if self.telegram.owner_user_id == 0 {
            anyhow::bail!("telegram.owner_user_id is not set");
        }
        if self.telegram.chat_id == 0 {
            anyhow::bail!("telegram.chat_id is not set");
        }
        if let Some(url) = &self.telegram.api_url {
            reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("telegram.api_url is not a valid URL: {}", e))?;
        }
        if self.downloads.dir.is_empty() {
            anyhow::bail!("downloads.dir must not be empty");
        }
        if self.downloads.max_concurrent == 0 {
            anyhow::bail!("downloads.max_concurrent must be at least 1");
        }
        if self.downloads.max_attempts == 0 {
            anyhow::bail!("downloads.max_attempts must be at least 1");
        }
        Ok(())
    }
}
