use std::{path::PathBuf, str::FromStr, time::Duration};
use teloxide::types::UserId;
use thiserror::Error;
use url::Url;

/// Bots cannot delete their messages once they are older than 48 hours.
const MAX_DELETION_MINUTES: u64 = 48 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is missing")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub admin_id: UserId,
    /// Without the leading `@`.
    pub bot_username: String,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
    pub store_path: PathBuf,
    pub discord: DiscordWebhooks,
    /// Public base URL. Webhook mode when set, long polling otherwise.
    pub app_url: Option<Url>,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
    pub port: u16,
    pub bot_api_url: Option<Url>,
    pub deletion_delay: Duration,
    pub deletion_poll: Duration,
    pub user_cooldown: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DiscordWebhooks {
    pub status: Option<String>,
    pub list_logs: Option<String>,
    pub file_access: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let bot_token = required("BOT_TOKEN")?;
        let admin_id = UserId(parse(&get, "ADMIN_ID")?.ok_or(ConfigError::Missing("ADMIN_ID"))?);
        let bot_username = required("BOT_USERNAME")?.trim_start_matches('@').to_string();

        let webhook_path = get("WEBHOOK_PATH").unwrap_or_else(|| "/webhook".to_string());
        let webhook_path = if webhook_path.starts_with('/') { webhook_path } else { format!("/{webhook_path}") };

        Ok(Self {
            bot_token,
            admin_id,
            bot_username,
            mongodb_uri: get("MONGODB_URI").or_else(|| get("MONGO_URI")),
            mongodb_database: get("MONGODB_DATABASE").unwrap_or_else(|| "telegram_bot".to_string()),
            store_path: get("STORE_PATH").unwrap_or_else(|| "storage.json".to_string()).into(),
            discord: DiscordWebhooks {
                status: get("DISCORD_WEBHOOK_STATUS"),
                list_logs: get("DISCORD_WEBHOOK_LIST_LOGS"),
                file_access: get("DISCORD_WEBHOOK_FILE_ACCESS"),
            },
            app_url: parse(&get, "APP_URL")?,
            webhook_path,
            webhook_secret: get("WEBHOOK_SECRET"),
            port: parse(&get, "PORT")?.unwrap_or(8443),
            bot_api_url: parse(&get, "BOT_API_URL")?,
            deletion_delay: deletion_delay(&get)?,
            deletion_poll: Duration::from_secs(parse(&get, "DELETION_POLL_SECONDS")?.unwrap_or(30)),
            user_cooldown: Duration::from_secs(parse(&get, "USER_COOLDOWN_SECONDS")?.unwrap_or(5)),
        })
    }

    /// Full URL Telegram posts updates to, if webhook mode is configured.
    pub fn webhook_url(&self) -> Option<Url> {
        let base = self.app_url.as_ref()?;
        // not `Url::join`: it drops the last base segment when there is no trailing slash
        Url::parse(&format!("{}{}", base.as_str().trim_end_matches('/'), self.webhook_path)).ok()
    }

    pub fn deletion_minutes(&self) -> u64 {
        self.deletion_delay.as_secs() / 60
    }
}

fn deletion_delay(get: &impl Fn(&str) -> Option<String>) -> Result<Duration, ConfigError> {
    let minutes = parse::<u64>(get, "DELETION_MINUTES")?.unwrap_or(30);
    if minutes > MAX_DELETION_MINUTES {
        return Err(ConfigError::Invalid { name: "DELETION_MINUTES", value: minutes.to_string() });
    }
    Ok(Duration::from_secs(minutes * 60))
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(name)
        .map(|value| value.parse().map_err(|_| ConfigError::Invalid { name, value }))
        .transpose()
}
