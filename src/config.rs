use std::time::Duration;

/// Runtime configuration, read from the environment.
///
/// Missing required keys abort startup; everything else falls back to a
/// sensible default so a bare `CHAT_BOT_TOKEN=... agenthub` works.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener port for the HTTP API and the agent WebSocket endpoint.
    pub port: u16,
    /// Telegram bot token.
    pub bot_token: String,
    /// Public base URL of this hub. When set, Telegram updates arrive via
    /// webhook at `<url>/webhook`; otherwise the bot long-polls.
    pub public_url: Option<String>,
    /// SQLite database URL or bare path. Absent switches persistence to the
    /// JSON-file credential fallback (tasks stay in-memory).
    pub database_url: Option<String>,
    /// Fallback chat for API-submitted task results when no active group is known.
    pub default_chat_id: Option<i64>,
    /// Optional shared secret for deployments that front the hub with a proxy.
    #[allow(dead_code)]
    pub hub_secret: Option<String>,
    /// Conversations idle longer than this are closed by the sweeper.
    pub conversation_idle: Duration,
    /// Sweeper tick interval.
    pub sweep_interval: Duration,
    /// Sliding-window rate limit for POST /api/tasks: (window, max requests).
    pub api_rate_limit: (Duration, u32),
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bot_token = std::env::var("CHAT_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("CHAT_BOT_TOKEN is required"))?;
        if bot_token.trim().is_empty() {
            anyhow::bail!("CHAT_BOT_TOKEN is required");
        }

        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("PORT is not a valid port number: {}", raw))?,
            Err(_) => 9900,
        };

        let default_chat_id = match std::env::var("DEFAULT_CHAT_ID") {
            Ok(raw) => Some(raw.parse::<i64>().map_err(|_| {
                anyhow::anyhow!("DEFAULT_CHAT_ID is not a valid chat id: {}", raw)
            })?),
            Err(_) => None,
        };

        Ok(Self {
            port,
            bot_token,
            public_url: env_opt("HUB_PUBLIC_URL"),
            database_url: env_opt("DATABASE_URL"),
            default_chat_id,
            hub_secret: env_opt("HUB_SECRET"),
            conversation_idle: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            api_rate_limit: (Duration::from_secs(60), 30),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
