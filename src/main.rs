mod config;
mod discord;
mod expiry;
mod session;
mod storage;
mod telegram;
mod tg;
#[cfg(test)]
mod testing;

use anyhow::Context;
use discord::{Channel, DiscordLogger};
use dotenvy::dotenv;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(config::Config::from_env().context("invalid configuration")?);
    let discord = DiscordLogger::new(config.discord.clone());

    let storage = match storage::Storage::connect(&config).await {
        Ok(s) => s,
        Err(e) => {
            discord.log_now(Channel::Status, &format!("Failed to open storage: {e}")).await;
            return Err(e).context("opening storage");
        }
    };

    let bot = telegram::build_bot(&config)?;
    let expiry = expiry::Expiry::new(
        bot.clone(),
        storage.clone(),
        discord.clone(),
        config.deletion_delay,
        config.deletion_poll,
    );
    // overdue deletions from a previous run are handled by the first sweep
    let sweeper = tokio::spawn(expiry.clone().run());

    discord.log(Channel::Status, "Bot is now online!");
    let app = tg::App::new(config, storage, discord.clone(), expiry);
    let result = tg::run(bot, app).await;

    sweeper.abort();
    discord.log_now(Channel::Status, "Bot is now offline.").await;
    result
}
