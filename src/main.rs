mod api;
mod chat;
mod config;
mod core;
mod db;
mod gateway;
mod protocol;
mod registry;
mod status;
mod store;
mod types;

#[cfg(test)]
mod integration_tests;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load environment file. AGENTHUB_ENV_FILE overrides .env discovery.
    if let Ok(path) = std::env::var("AGENTHUB_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load AGENTHUB_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("agenthub {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("agenthub {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: agenthub");
                println!("\nConfiguration is read from the environment (.env supported):");
                println!("  CHAT_BOT_TOKEN   Telegram bot token (required)");
                println!("  PORT             HTTP/WebSocket listener port (default 9900)");
                println!("  HUB_PUBLIC_URL   Public base URL; enables webhook mode");
                println!("  DATABASE_URL     SQLite URL or path; omit for file fallback");
                println!("  DEFAULT_CHAT_ID  Fallback chat for API task results");
                println!("  HUB_SECRET       Optional shared secret");
                return Ok(());
            }
            _ => {}
        }
    }

    let config = config::Config::from_env()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::core::run(config))
}
