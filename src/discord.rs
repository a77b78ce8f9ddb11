use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::DiscordWebhooks;

const DESCRIPTION_LIMIT: usize = 4096;
const ATTEMPTS: u32 = 3;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);
const ERROR_COLOR: u32 = 0xFF0000;

/// Which webhook a log line goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// startup, shutdown, errors
    Status,
    /// admin actions
    ListLogs,
    /// file deliveries
    FileAccess,
}

struct Style {
    title: &'static str,
    color: u32,
    author: &'static str,
    footer: &'static str,
}

impl Channel {
    fn style(self) -> Style {
        const AUTHOR: &str = "Telegram Bot";
        const FOOTER: &str = "Movie Vault";
        match self {
            Channel::Status => Style { title: "Bot Status Update", color: 0xFF0000, author: AUTHOR, footer: FOOTER },
            Channel::ListLogs => Style { title: "Admin Action Log", color: 0x00FF00, author: AUTHOR, footer: FOOTER },
            Channel::FileAccess => Style { title: "File Access Log", color: 0x0000FF, author: AUTHOR, footer: FOOTER },
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("discord request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("discord answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("still rate limited after {0} attempts")]
    RateLimited(u32),
}

/// Mirrors bot activity to Discord webhooks. Channels without a URL only go to tracing.
#[derive(Clone)]
pub struct DiscordLogger {
    http: Client,
    webhooks: DiscordWebhooks,
}

impl DiscordLogger {
    pub fn new(webhooks: DiscordWebhooks) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, webhooks }
    }

    /// Fire-and-forget: delivery happens on a spawned task and never fails the caller.
    pub fn log(&self, channel: Channel, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(?channel, "{message}");
        if self.url(channel).is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.deliver(channel, &message).await });
    }

    /// Same as [`log`](Self::log) but waits for the delivery, for shutdown paths.
    pub async fn log_now(&self, channel: Channel, message: &str) {
        tracing::info!(?channel, "{message}");
        self.deliver(channel, message).await;
    }

    async fn deliver(&self, channel: Channel, message: &str) {
        let Some(url) = self.url(channel) else { return };
        let Err(e) = self.send(url, &embed(channel, message)).await else { return };

        tracing::warn!(?channel, error = %e, "discord log failed");
        if channel != Channel::Status {
            if let Some(status) = self.url(Channel::Status) {
                let report = Embed {
                    title: None,
                    description: clip(&format!("Failed to send Discord log ({channel:?}): {e}"), DESCRIPTION_LIMIT),
                    color: ERROR_COLOR,
                    author: None,
                    footer: None,
                    timestamp: now_rfc3339(),
                };
                // one shot, no fallback for the fallback
                if let Err(e) = self.send(status, &report).await {
                    tracing::warn!(error = %e, "discord status webhook failed too");
                }
            }
        }
    }

    async fn send(&self, url: &str, embed: &Embed<'_>) -> Result<(), DiscordError> {
        let payload = Payload { embeds: [embed] };
        for _ in 0..ATTEMPTS {
            let resp = self.http.post(url).json(&payload).send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = resp
                    .json::<RateLimit>()
                    .await
                    .map(|r| Duration::from_secs_f64(r.retry_after.clamp(0.0, MAX_RETRY_AFTER.as_secs_f64())))
                    .unwrap_or(Duration::from_secs(1));
                tracing::debug!(?wait, "discord rate limited");
                tokio::time::sleep(wait.min(MAX_RETRY_AFTER)).await;
                continue;
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscordError::Status { status, body });
        }
        Err(DiscordError::RateLimited(ATTEMPTS))
    }

    fn url(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Status => self.webhooks.status.as_deref(),
            Channel::ListLogs => self.webhooks.list_logs.as_deref(),
            Channel::FileAccess => self.webhooks.file_access.as_deref(),
        }
    }
}

fn embed(channel: Channel, message: &str) -> Embed<'static> {
    let style = channel.style();
    Embed {
        title: Some(style.title),
        description: clip(message, DESCRIPTION_LIMIT),
        color: style.color,
        author: Some(Author { name: style.author }),
        footer: Some(Footer { text: style.footer }),
        timestamp: now_rfc3339(),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// At most `max` characters, cut on a grapheme boundary so emoji and combined
/// characters stay intact.
fn clip(s: &str, max: usize) -> String {
    let mut out = String::new();
    let mut chars = 0;
    for g in s.graphemes(true) {
        chars += g.chars().count();
        if chars > max {
            break;
        }
        out.push_str(g);
    }
    out
}

/* ======= DTOs ======= */

#[derive(Serialize)]
struct Payload<'a> {
    embeds: [&'a Embed<'a>; 1],
}

#[derive(Serialize, Debug)]
struct Embed<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    description: String,
    color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<Author<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<Footer<'a>>,
    timestamp: String,
}

#[derive(Serialize, Debug)]
struct Author<'a> {
    name: &'a str,
}

#[derive(Serialize, Debug)]
struct Footer<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct RateLimit {
    retry_after: f64,
}
