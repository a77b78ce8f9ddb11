use once_cell::sync::Lazy;
use regex::Regex;
use std::{future::Future, time::Duration};
use teloxide::{
    prelude::*,
    requests::Request,
    types::{ChatId, FileId, InlineKeyboardMarkup, InputFile, MessageId, ParseMode},
    ApiError, RequestError,
};

use crate::config::Config;
use crate::storage::{FileKind, Movie};

const ATTEMPTS: u32 = 3;
const BACKOFF: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BROADCAST_SPACING: Duration = Duration::from_millis(100);

/// Telegram only accepts these characters in a `start` parameter.
static START_PAYLOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

pub fn build_bot(config: &Config) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings().timeout(HTTP_TIMEOUT).build()?;
    let bot = Bot::with_client(config.bot_token.clone(), client);
    Ok(match &config.bot_api_url {
        Some(url) => {
            tracing::info!(%url, "using custom Bot API URL");
            bot.set_api_url(url.clone())
        }
        None => bot,
    })
}

/// Runs a request, retrying network failures and flood waits. API errors are returned as is.
async fn with_retry<T, F, Fut>(method: &str, mut call: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = 1;
    loop {
        let wait = match call().await {
            Ok(value) => return Ok(value),
            Err(RequestError::RetryAfter(secs)) if attempt < ATTEMPTS => secs.duration(),
            Err(RequestError::Network(e)) if attempt < ATTEMPTS => {
                tracing::debug!(method, attempt, error = %e, "network error, retrying");
                BACKOFF
            }
            Err(e) => return Err(e),
        };
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

/// Sends an HTML message. Failures are logged and swallowed.
pub async fn send_text(bot: &Bot, chat: ChatId, html: &str) -> Option<Message> {
    let sent = with_retry("sendMessage", || {
        bot.send_message(chat, html.to_string()).parse_mode(ParseMode::Html).send()
    })
    .await;
    log_failure("sendMessage", chat, sent)
}

pub async fn send_text_with_keyboard(
    bot: &Bot,
    chat: ChatId,
    html: &str,
    keyboard: InlineKeyboardMarkup,
) -> Option<Message> {
    let sent = with_retry("sendMessage", || {
        bot.send_message(chat, html.to_string())
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone())
            .send()
    })
    .await;
    log_failure("sendMessage", chat, sent)
}

/// Re-sends a stored file by its `file_id`, captioned with the movie name.
pub async fn send_file(bot: &Bot, chat: ChatId, movie: &Movie) -> Option<Message> {
    let file = || InputFile::file_id(FileId(movie.file_id.clone()));
    let caption = format!("<b>{}</b>", html_escape(&movie.name));
    let sent = match movie.kind {
        FileKind::Document => {
            with_retry("sendDocument", || {
                bot.send_document(chat, file()).caption(caption.clone()).parse_mode(ParseMode::Html).send()
            })
            .await
        }
        FileKind::Video => {
            with_retry("sendVideo", || {
                bot.send_video(chat, file()).caption(caption.clone()).parse_mode(ParseMode::Html).send()
            })
            .await
        }
    };
    log_failure("sendFile", chat, sent)
}

/// `true` once the message is gone, including when Telegram says it already was.
pub async fn delete_message(bot: &Bot, chat: ChatId, id: MessageId) -> bool {
    match with_retry("deleteMessage", || bot.delete_message(chat, id).send()).await {
        Ok(_) => true,
        Err(RequestError::Api(ApiError::MessageToDeleteNotFound | ApiError::MessageCantBeDeleted)) => {
            tracing::debug!(chat_id = chat.0, message_id = id.0, "message already gone");
            true
        }
        Err(e) => {
            tracing::warn!(chat_id = chat.0, message_id = id.0, error = %e, "deleteMessage failed");
            false
        }
    }
}

pub async fn answer_callback(bot: &Bot, q: &CallbackQuery, text: &str) {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).text(text).show_alert(false).await {
        tracing::warn!(error = %e, "answerCallbackQuery failed");
    }
}

/// Sends the same message to every chat, spaced out to stay under flood limits.
/// Returns `(succeeded, failed)`.
pub async fn broadcast(bot: &Bot, chats: &[ChatId], html: &str) -> (usize, usize) {
    let mut ok = 0;
    for (i, chat) in chats.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(BROADCAST_SPACING).await;
        }
        if send_text(bot, *chat, html).await.is_some() {
            ok += 1;
        }
    }
    (ok, chats.len() - ok)
}

fn log_failure(method: &str, chat: ChatId, sent: Result<Message, RequestError>) -> Option<Message> {
    match sent {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(method, chat_id = chat.0, error = %e, "telegram request failed");
            None
        }
    }
}

/* ====== Deep links ====== */

/// `start` parameter for a movie name: spaces become underscores. `None` if the
/// result still has characters Telegram rejects, or if the name mixes spaces and
/// underscores: [`payload_candidates`] could not map such a payload back.
pub fn start_payload(name: &str) -> Option<String> {
    let name = name.trim();
    if name.contains(' ') && name.contains('_') {
        return None;
    }
    let payload = name.replace(' ', "_");
    START_PAYLOAD.is_match(&payload).then_some(payload)
}

pub fn deep_link(bot_username: &str, name: &str) -> Option<String> {
    start_payload(name).map(|p| format!("https://t.me/{bot_username}?start={p}"))
}

/// Names a `start` parameter may refer to, most specific first.
pub fn payload_candidates(payload: &str) -> Vec<String> {
    let payload = payload.trim();
    let spaced = payload.replace('_', " ");
    if spaced == payload {
        vec![payload.to_string()]
    } else {
        vec![payload.to_string(), spaced]
    }
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
