use crate::config::Config;
use crate::discord::{Channel, DiscordLogger};
use crate::expiry::Expiry;
use crate::session::{Cooldowns, PendingUpload, PendingUploads};
use crate::storage::{BotUser, FileKind, Movie, Storage, StorageError};
use crate::telegram::{self, deep_link, html_escape};
use axum::routing::get;
use chrono::Utc;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, User},
    update_listeners::webhooks,
    utils::command::{BotCommands, ParseError},
};

/// How long an uploaded file waits for its name.
const PENDING_UPLOAD_TTL: Duration = Duration::from_secs(10 * 60);
/// Telegram limit for `callback_data`.
const CALLBACK_DATA_LIMIT: usize = 64;

const NOT_AUTHORIZED: &str = "⛔ You are not authorized to use this command.";
const STORAGE_FAILED: &str = "⚠️ Storage error, command failed.";

/* ====== Commands ====== */
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Commands:")]
enum Command {
    #[command(description = "get a movie: /start Movie_Name")]
    Start(String),
    #[command(description = "show this help")]
    Help,
    #[command(description = "list stored files")]
    ListFiles,
    #[command(description = "share link: /get_movie_link Movie Name")]
    GetMovieLink(String),
    #[command(description = "rename: /rename_file OldName New Name")]
    RenameFile(String),
    #[command(description = "delete: /delete_file Movie Name")]
    DeleteFile(String),
    #[command(description = "message every user: /announce text")]
    Announce(String),
    #[command(description = "movie and user counts")]
    Stats,
    #[command(description = "uptime, memory and cpu")]
    Health,
}

/// Everything a handler needs besides the bot itself.
#[derive(Clone)]
pub struct App {
    config: Arc<Config>,
    storage: Storage,
    discord: DiscordLogger,
    expiry: Expiry,
    pending: PendingUploads,
    cooldowns: Cooldowns,
    started: Instant,
}

impl App {
    pub fn new(config: Arc<Config>, storage: Storage, discord: DiscordLogger, expiry: Expiry) -> Self {
        let cooldowns = Cooldowns::new(config.user_cooldown);
        Self {
            config,
            storage,
            discord,
            expiry,
            pending: PendingUploads::new(PENDING_UPLOAD_TTL),
            cooldowns,
            started: Instant::now(),
        }
    }

    fn is_admin(&self, user: &User) -> bool {
        user.id == self.config.admin_id
    }

    /// Logs a storage failure and tells the admin the command did not go through.
    async fn storage_failed(&self, bot: &Bot, chat: ChatId, action: &str, e: StorageError) {
        tracing::error!(action, error = %e, "storage error");
        self.discord.log(Channel::Status, format!("Storage error while {action}: {e}"));
        telegram::send_text(bot, chat, STORAGE_FAILED).await;
    }
}

pub async fn run(bot: Bot, app: App) -> anyhow::Result<()> {
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint({
            let app = app.clone();
            move |bot: Bot, msg: Message| {
                let app = app.clone();
                async move { on_message(bot, msg, &app).await }
            }
        }))
        .branch(Update::filter_callback_query().endpoint({
            let app = app.clone();
            move |bot: Bot, q: CallbackQuery| {
                let app = app.clone();
                async move { on_callback(bot, q, &app).await }
            }
        }));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler).enable_ctrlc_handler().build();

    let Some(url) = app.config.webhook_url() else {
        tracing::info!("long polling mode");
        if let Err(e) = bot.delete_webhook().await {
            tracing::warn!(error = %e, "deleteWebhook failed, continuing");
        }
        dispatcher.dispatch().await;
        return Ok(());
    };

    tracing::info!(%url, "webhook mode");
    let address = SocketAddr::from(([0, 0, 0, 0], app.config.port));
    let mut options = webhooks::Options::new(address, url);
    if let Some(secret) = &app.config.webhook_secret {
        options = options.secret_token(secret.clone());
    }
    let (listener, stop_flag, router) = webhooks::axum_to_router(bot.clone(), options).await?;
    let router = router.route("/", get(|| async { "Bot is running!" }));

    let tcp = tokio::net::TcpListener::bind(address).await?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp, router).with_graceful_shutdown(stop_flag).await {
            tracing::error!(error = %e, "webhook server failed");
        }
    });

    dispatcher
        .dispatch_with_listener(listener, LoggingErrorHandler::with_custom_text("webhook listener error"))
        .await;
    server.abort();
    Ok(())
}

/* ====== Messages ====== */
async fn on_message(bot: Bot, msg: Message, app: &App) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else { return Ok(()) };
    let chat = msg.chat.id;
    let is_admin = app.is_admin(&user);

    if !is_admin {
        track_user(app, &user).await;
    }

    if let Some(upload) = uploaded_file(&msg) {
        if is_admin {
            app.pending.remember(chat, upload).await;
            telegram::send_text(&bot, chat, "Send the name of this movie to store it:").await;
        }
        return Ok(());
    }

    let Some(text) = msg.text() else { return Ok(()) };
    if text.starts_with('/') {
        return on_command_text(&bot, chat, &user, text, app).await;
    }

    if is_admin {
        match app.pending.take(chat).await {
            Some(upload) => store_named_upload(&bot, chat, text, upload, app).await,
            None => {
                let reply = format!(
                    "No file is waiting for a name. Send the file first, then its name within {} minutes.",
                    PENDING_UPLOAD_TTL.as_secs() / 60
                );
                telegram::send_text(&bot, chat, &reply).await;
            }
        }
    }
    Ok(())
}

fn uploaded_file(msg: &Message) -> Option<PendingUpload> {
    if let Some(doc) = msg.document() {
        return Some(PendingUpload { file_id: doc.file.id.0.clone(), kind: FileKind::Document });
    }
    msg.video().map(|v| PendingUpload { file_id: v.file.id.0.clone(), kind: FileKind::Video })
}

async fn track_user(app: &App, user: &User) {
    let record = BotUser { user_id: user.id.0, display_name: display_name(user), last_seen: Utc::now() };
    if let Err(e) = app.storage.upsert_user(record).await {
        tracing::warn!(user_id = user.id.0, error = %e, "saving user failed");
    }
}

async fn store_named_upload(bot: &Bot, chat: ChatId, text: &str, upload: PendingUpload, app: &App) {
    let name = text.trim();
    if name.is_empty() {
        app.pending.remember(chat, upload).await;
        return;
    }
    let movie = Movie { name: name.to_string(), file_id: upload.file_id, kind: upload.kind };
    match app.storage.put_movie(movie).await {
        Ok(replaced) => {
            let verb = if replaced { "updated" } else { "added" };
            let mut reply = format!("Movie '{}' has been {verb}.", html_escape(name));
            if let Some(link) = deep_link(&app.config.bot_username, name) {
                reply.push_str(&format!("\n{link}"));
            }
            telegram::send_text(bot, chat, &reply).await;
            app.discord.log(Channel::ListLogs, format!("Movie {verb}: {name}"));
        }
        Err(e) => app.storage_failed(bot, chat, "saving a movie", e).await,
    }
}

async fn on_command_text(bot: &Bot, chat: ChatId, user: &User, text: &str, app: &App) -> ResponseResult<()> {
    match Command::parse(text, &app.config.bot_username) {
        // addressed to another bot in a group
        Err(ParseError::WrongBotName(_)) => {}
        Ok(Command::Start(payload)) => on_start(bot, chat, user, &payload, app).await,
        _ if !app.is_admin(user) => {
            telegram::send_text(bot, chat, NOT_AUTHORIZED).await;
            let command = text.split_whitespace().next().unwrap_or_default();
            tracing::info!(user_id = user.id.0, command, "refused admin command");
        }
        Ok(cmd) => on_admin_command(bot, chat, cmd, app).await,
        Err(_) => {
            telegram::send_text(bot, chat, "Unknown command. Use /help for available commands.").await;
        }
    }
    Ok(())
}

/* ====== /start: deliver a file ====== */
async fn on_start(bot: &Bot, chat: ChatId, user: &User, payload: &str, app: &App) {
    let payload = payload.trim();
    if payload.is_empty() {
        telegram::send_text(bot, chat, "👋 Hi! Open a movie link to receive your file.").await;
        return;
    }
    if !app.is_admin(user) && !app.cooldowns.try_acquire(user.id).await {
        telegram::send_text(bot, chat, "⏳ Please wait a few seconds before requesting another file.").await;
        return;
    }

    let mut found = None;
    for name in telegram::payload_candidates(payload) {
        match app.storage.get_movie(&name).await {
            Ok(Some(movie)) => {
                found = Some(movie);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "movie lookup failed");
                app.discord.log(Channel::Status, format!("Movie lookup for '{name}' failed: {e}"));
                telegram::send_text(bot, chat, "⚠️ Something went wrong, please try again later.").await;
                return;
            }
        }
    }

    match found {
        Some(movie) => deliver(bot, chat, user, &movie, app).await,
        None => {
            let name = payload.replace('_', " ");
            telegram::send_text(bot, chat, &format!("Movie '{}' not found.", html_escape(&name))).await;
        }
    }
}

/// Sends the file plus the expiry warning and persists their deletion.
async fn deliver(bot: &Bot, chat: ChatId, user: &User, movie: &Movie, app: &App) {
    let Some(file_msg) = telegram::send_file(bot, chat, movie).await else {
        telegram::send_text(bot, chat, "⚠️ Could not send the file, please try again later.").await;
        return;
    };

    let minutes = app.config.deletion_minutes();
    let warning = format!(
        "❗️ <b>IMPORTANT</b> ❗️\n\n\
         This video / file will be deleted in <b>{minutes} minutes</b> <i>(due to copyright issues)</i>.\n\n\
         📌 <b>Please forward it somewhere else and start downloading there.</b>"
    );
    let warning_msg = telegram::send_text(bot, chat, &warning).await;

    if let Err(e) = app.expiry.schedule(chat, file_msg.id, warning_msg.map(|m| m.id)).await {
        tracing::error!(chat_id = chat.0, error = %e, "scheduling deletion failed");
        app.discord.log(Channel::Status, format!("Could not schedule deletion in chat {}: {e}", chat.0));
    }
    app.discord.log(
        Channel::FileAccess,
        format!("{} (ID: {}) accessed movie: {}", display_name(user), user.id.0, movie.name),
    );
}

/* ====== Admin commands ====== */
async fn on_admin_command(bot: &Bot, chat: ChatId, cmd: Command, app: &App) {
    match cmd {
        Command::Help => {
            telegram::send_text(bot, chat, &html_escape(&Command::descriptions().to_string())).await;
        }
        Command::ListFiles => send_list_view(bot, chat, app).await,
        Command::GetMovieLink(name) => get_movie_link(bot, chat, name.trim(), app).await,
        Command::RenameFile(args) => rename_file(bot, chat, &args, app).await,
        Command::DeleteFile(name) => delete_file(bot, chat, name.trim(), app).await,
        Command::Announce(text) => announce(bot, chat, text.trim(), app).await,
        Command::Stats => stats(bot, chat, app).await,
        Command::Health => health(bot, chat, app).await,
        // handled before the admin check
        Command::Start(payload) => {
            tracing::debug!(%payload, "start reached admin dispatch");
        }
    }
}

async fn send_list_view(bot: &Bot, chat: ChatId, app: &App) {
    let movies = match app.storage.list_movies().await {
        Ok(m) => m,
        Err(e) => return app.storage_failed(bot, chat, "listing movies", e).await,
    };
    if movies.is_empty() {
        telegram::send_text(bot, chat, "No files stored.").await;
        return;
    }
    let lines: Vec<_> = movies.iter().map(|m| format!("• {}", html_escape(&m.name))).collect();
    let text = format!("<b>Stored Files ({}):</b>\n{}", movies.len(), lines.join("\n"));
    for part in split_by_chars(&text, 4000) {
        telegram::send_text(bot, chat, &part).await;
    }
    let kb = keyboard_list(&movies);
    if !kb.inline_keyboard.is_empty() {
        telegram::send_text_with_keyboard(bot, chat, "Tap a movie for its link, 🗑 to delete:", kb).await;
    }
}

async fn get_movie_link(bot: &Bot, chat: ChatId, name: &str, app: &App) {
    if name.is_empty() {
        telegram::send_text(bot, chat, "Usage: /get_movie_link Movie Name").await;
        return;
    }
    match app.storage.get_movie(name).await {
        Ok(Some(movie)) => send_link(bot, chat, &movie.name, app).await,
        Ok(None) => not_found(bot, chat, name).await,
        Err(e) => app.storage_failed(bot, chat, "looking up a movie", e).await,
    }
}

async fn send_link(bot: &Bot, chat: ChatId, name: &str, app: &App) {
    match deep_link(&app.config.bot_username, name) {
        Some(link) => {
            telegram::send_text(bot, chat, &format!("Click here to get the movie: {link}")).await;
            app.discord.log(Channel::ListLogs, format!("Generated link for: {name}"));
        }
        None => {
            let reply = format!(
                "'{}' cannot be used in a link: only latin letters, digits, spaces, '_' and '-' \
                 (at most 64, spaces and '_' not mixed) are allowed. Rename it with /rename_file.",
                html_escape(name)
            );
            telegram::send_text(bot, chat, &reply).await;
        }
    }
}

async fn rename_file(bot: &Bot, chat: ChatId, args: &str, app: &App) {
    let Some((old, new)) = args.trim().split_once(char::is_whitespace).map(|(o, n)| (o, n.trim())) else {
        telegram::send_text(bot, chat, "Usage: /rename_file OldName NewName").await;
        return;
    };
    if new.is_empty() {
        telegram::send_text(bot, chat, "Usage: /rename_file OldName NewName").await;
        return;
    }
    match app.storage.rename_movie(old, new).await {
        Ok(true) => {
            let reply = format!("Renamed '{}' to '{}'.", html_escape(old), html_escape(new));
            telegram::send_text(bot, chat, &reply).await;
            app.discord.log(Channel::ListLogs, format!("Renamed '{old}' to '{new}'"));
        }
        Ok(false) => not_found(bot, chat, old).await,
        Err(e) => app.storage_failed(bot, chat, "renaming a movie", e).await,
    }
}

async fn delete_file(bot: &Bot, chat: ChatId, name: &str, app: &App) {
    if name.is_empty() {
        telegram::send_text(bot, chat, "Usage: /delete_file FileName").await;
        return;
    }
    match app.storage.delete_movie(name).await {
        Ok(true) => {
            telegram::send_text(bot, chat, &format!("Deleted '{}'.", html_escape(name))).await;
            app.discord.log(Channel::ListLogs, format!("Deleted movie: {name}"));
        }
        Ok(false) => not_found(bot, chat, name).await,
        Err(e) => app.storage_failed(bot, chat, "deleting a movie", e).await,
    }
}

async fn announce(bot: &Bot, chat: ChatId, text: &str, app: &App) {
    if text.is_empty() {
        telegram::send_text(bot, chat, "Usage: /announce Your announcement message").await;
        return;
    }
    let users = match app.storage.list_users().await {
        Ok(u) => u,
        Err(e) => return app.storage_failed(bot, chat, "loading users", e).await,
    };
    if users.is_empty() {
        telegram::send_text(bot, chat, "No users to announce to.").await;
        return;
    }
    let chats: Vec<ChatId> = users.iter().map(|u| ChatId(u.user_id as i64)).collect();
    let (ok, failed) = telegram::broadcast(bot, &chats, &html_escape(text)).await;
    let reply = format!("📢 Announcement sent!\nSuccess: {ok} users\nFailed: {failed} users");
    telegram::send_text(bot, chat, &reply).await;
    app.discord.log(
        Channel::ListLogs,
        format!("Announcement sent to {ok} users, failed for {failed} users"),
    );
}

async fn stats(bot: &Bot, chat: ChatId, app: &App) {
    match app.storage.stats().await {
        Ok(s) => {
            let reply = format!(
                "📊 Bot Statistics:\nTotal Movies: {}\nTotal Users: {}\nPending Deletions: {}",
                s.movies, s.users, s.pending_deletions
            );
            telegram::send_text(bot, chat, &reply).await;
        }
        Err(e) => app.storage_failed(bot, chat, "collecting stats", e).await,
    }
}

async fn health(bot: &Bot, chat: ChatId, app: &App) {
    let uptime = format_uptime(app.started.elapsed());
    let usage = tokio::task::spawn_blocking(process_usage).await.ok().flatten();
    let reply = match usage {
        Some((mem_mb, cpu)) => format!(
            "🩺 <b>Bot Health Check</b>\n\n<b>Uptime</b>: {uptime}\n<b>Memory Usage</b>: {mem_mb:.2} MB\n<b>CPU Usage</b>: {cpu:.2}%"
        ),
        None => format!("🩺 <b>Bot Health Check</b>\n\n<b>Uptime</b>: {uptime}\n<i>process metrics unavailable</i>"),
    };
    telegram::send_text(bot, chat, &reply).await;
    app.discord.log(Channel::ListLogs, format!("Admin requested health check: uptime {uptime}"));
}

/// Resident memory in MB and cpu percent of this process. Blocks for
/// [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`]: cpu usage is the delta of two refreshes.
fn process_usage() -> Option<(f64, f32)> {
    let pid = sysinfo::get_current_pid().ok()?;
    let kind = ProcessRefreshKind::new().with_cpu().with_memory();
    let mut sys = System::new();
    // process cpu is only computed on full refreshes
    sys.refresh_processes_specifics(ProcessesToUpdate::All, kind);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes_specifics(ProcessesToUpdate::All, kind);
    let process = sys.process(pid)?;
    Some((process.memory() as f64 / 1024.0 / 1024.0, process.cpu_usage()))
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

async fn not_found(bot: &Bot, chat: ChatId, name: &str) {
    telegram::send_text(bot, chat, &format!("Movie '{}' not found.", html_escape(name))).await;
}

/* ====== Callback buttons ======
   link:<name>  send the deep link
   del:<name>   delete the movie
*/
async fn on_callback(bot: Bot, q: CallbackQuery, app: &App) -> ResponseResult<()> {
    let Some(data) = q.data.clone() else { return Ok(()) };
    if !app.is_admin(&q.from) {
        telegram::answer_callback(&bot, &q, NOT_AUTHORIZED).await;
        return Ok(());
    }
    let chat = q.message.as_ref().map(|m| m.chat().id).unwrap_or_else(|| q.from.id.into());
    let (action, name) = data.split_once(':').unwrap_or((data.as_str(), ""));

    match action {
        "link" => {
            telegram::answer_callback(&bot, &q, "Link sent").await;
            send_link(&bot, chat, name, app).await;
        }
        "del" => match app.storage.delete_movie(name).await {
            Ok(true) => {
                telegram::answer_callback(&bot, &q, "Deleted").await;
                app.discord.log(Channel::ListLogs, format!("Deleted movie: {name}"));
                send_list_view(&bot, chat, app).await;
            }
            Ok(false) => telegram::answer_callback(&bot, &q, "Not found").await,
            Err(e) => {
                telegram::answer_callback(&bot, &q, "Storage error").await;
                app.storage_failed(&bot, chat, "deleting a movie", e).await;
            }
        },
        _ => telegram::answer_callback(&bot, &q, "Unknown action").await,
    }
    Ok(())
}

/* ====== Helpers ====== */

fn keyboard_list(movies: &[Movie]) -> InlineKeyboardMarkup {
    let rows = movies
        .iter()
        // names too long for callback data only appear in the text list
        .filter(|m| format!("link:{}", m.name).len() <= CALLBACK_DATA_LIMIT)
        .map(|m| {
            vec![
                InlineKeyboardButton::callback(format!("🎬 {}", m.name), format!("link:{}", m.name)),
                InlineKeyboardButton::callback("🗑".to_string(), format!("del:{}", m.name)),
            ]
        });
    InlineKeyboardMarkup::new(rows)
}

fn display_name(user: &User) -> String {
    if let Some(username) = &user.username {
        return format!("@{username}");
    }
    let full = user.full_name();
    if full.trim().is_empty() { "Unknown User".to_string() } else { full.trim().to_string() }
}

fn split_by_chars(s: &str, max: usize) -> Vec<String> {
    if s.chars().count() <= max {
        return vec![s.to_string()];
    }
    let mut out = Vec::new();
    let mut cur = String::new();
    for line in s.split_inclusive('\n') {
        if !cur.is_empty() && cur.chars().count() + line.chars().count() > max {
            out.push(std::mem::take(&mut cur));
        }
        cur.push_str(line);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscordWebhooks;
    use crate::testing::{self, ADMIN};
    use wiremock::MockServer;

    const USER: i64 = 7;

    async fn setup(server: &MockServer, dir: &tempfile::TempDir) -> (Bot, App) {
        testing::mock_all(server).await;
        let config = Arc::new(testing::config(&dir.path().join("store.json")));
        let storage = Storage::json(config.store_path.clone()).await.unwrap();
        let discord = DiscordLogger::new(DiscordWebhooks::default());
        let bot = testing::bot(server);
        let expiry = Expiry::new(
            bot.clone(),
            storage.clone(),
            discord.clone(),
            config.deletion_delay,
            config.deletion_poll,
        );
        (bot, App::new(config, storage, discord, expiry))
    }

    async fn put(app: &App, name: &str) {
        let movie = Movie { name: name.to_string(), file_id: format!("file-{name}"), kind: FileKind::Document };
        app.storage.put_movie(movie).await.unwrap();
    }

    async fn say(bot: &Bot, app: &App, from: i64, text: &str) {
        on_message(bot.clone(), testing::text(from, text), app).await.unwrap();
    }

    async fn last_text(server: &MockServer) -> String {
        testing::sent_texts(server).await.pop().unwrap_or_default()
    }

    #[tokio::test]
    async fn upload_then_name_stores_movie() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::video(ADMIN, "vid-1"), &app).await.unwrap();
        assert_eq!(last_text(&server).await, "Send the name of this movie to store it:");
        say(&bot, &app, ADMIN, "The Matrix").await;

        let movie = app.storage.get_movie("The Matrix").await.unwrap().unwrap();
        assert_eq!(movie.file_id, "vid-1");
        assert_eq!(movie.kind, FileKind::Video);
        let reply = last_text(&server).await;
        assert!(reply.starts_with("Movie 'The Matrix' has been added."), "{reply}");
        assert!(reply.contains("https://t.me/vault_bot?start=The_Matrix"), "{reply}");
    }

    #[tokio::test]
    async fn reupload_reports_update() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        on_message(bot.clone(), testing::document(ADMIN, "doc-2"), &app).await.unwrap();
        say(&bot, &app, ADMIN, "Heat").await;

        assert!(last_text(&server).await.starts_with("Movie 'Heat' has been updated."));
        assert_eq!(app.storage.get_movie("Heat").await.unwrap().unwrap().file_id, "doc-2");
    }

    #[tokio::test]
    async fn name_without_upload_gets_a_hint() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        say(&bot, &app, ADMIN, "The Matrix").await;
        assert!(last_text(&server).await.starts_with("No file is waiting for a name."));
        assert!(app.storage.list_movies().await.unwrap().is_empty());

        // users chatting with the bot get no reply
        say(&bot, &app, USER, "The Matrix").await;
        assert_eq!(testing::calls(&server, "sendMessage").await, 1);
    }

    #[tokio::test]
    async fn expired_upload_is_not_stored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, mut app) = setup(&server, &dir).await;
        app.pending = PendingUploads::new(Duration::from_millis(20));

        on_message(bot.clone(), testing::document(ADMIN, "doc-1"), &app).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        say(&bot, &app, ADMIN, "Heat").await;

        assert!(app.storage.get_movie("Heat").await.unwrap().is_none());
        assert!(last_text(&server).await.contains("Send the file first"));
    }

    #[tokio::test]
    async fn command_does_not_consume_pending_upload() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::document(ADMIN, "doc-1"), &app).await.unwrap();
        say(&bot, &app, ADMIN, "/stats").await;
        say(&bot, &app, ADMIN, "Heat").await;

        assert!(app.storage.get_movie("Heat").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_admin_upload_is_not_stored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::document(USER, "doc-1"), &app).await.unwrap();
        say(&bot, &app, USER, "Heat").await;

        assert!(app.storage.list_movies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_delivers_file_and_schedules_deletion() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        let before = Utc::now();
        say(&bot, &app, USER, "/start Heat").await;

        assert_eq!(testing::calls(&server, "sendDocument").await, 1);
        let warning = last_text(&server).await;
        assert!(warning.contains("deleted in <b>30 minutes</b>"), "{warning}");

        let stats = app.storage.stats().await.unwrap();
        assert_eq!((stats.movies, stats.users, stats.pending_deletions), (1, 1, 1));
        let delete_at = app.storage.next_deletion_at().await.unwrap().unwrap();
        assert!(delete_at >= before + chrono::Duration::minutes(30));
        assert!(delete_at <= Utc::now() + chrono::Duration::minutes(30));
    }

    #[tokio::test]
    async fn video_is_delivered_as_video() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::video(ADMIN, "vid-1"), &app).await.unwrap();
        say(&bot, &app, ADMIN, "Heat").await;
        say(&bot, &app, USER, "/start Heat").await;

        assert_eq!(testing::calls(&server, "sendVideo").await, 1);
        assert_eq!(testing::calls(&server, "sendDocument").await, 0);
        assert_eq!(app.storage.stats().await.unwrap().pending_deletions, 1);
    }

    #[tokio::test]
    async fn start_with_unknown_movie() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        say(&bot, &app, USER, "/start Ghost_Movie").await;

        assert_eq!(last_text(&server).await, "Movie 'Ghost Movie' not found.");
        assert_eq!(testing::calls(&server, "sendDocument").await, 0);
        assert_eq!(app.storage.stats().await.unwrap().pending_deletions, 0);
    }

    #[tokio::test]
    async fn start_without_payload_greets() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        say(&bot, &app, USER, "/start").await;
        assert!(last_text(&server).await.starts_with("👋 Hi!"));
    }

    #[tokio::test]
    async fn repeated_start_hits_cooldown() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        say(&bot, &app, USER, "/start Heat").await;
        say(&bot, &app, USER, "/start Heat").await;

        assert_eq!(testing::calls(&server, "sendDocument").await, 1);
        assert!(last_text(&server).await.starts_with("⏳"));
    }

    #[tokio::test]
    async fn non_admin_commands_are_refused() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        for cmd in ["/delete_file Heat", "/rename_file Heat Cold", "/list_files", "/announce hi", "/bogus"] {
            say(&bot, &app, USER, cmd).await;
            assert_eq!(last_text(&server).await, NOT_AUTHORIZED, "{cmd}");
        }
        assert_eq!(app.storage.list_movies().await.unwrap().len(), 1);
        assert!(app.storage.get_movie("Heat").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_admin_command() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        say(&bot, &app, ADMIN, "/bogus").await;
        assert_eq!(last_text(&server).await, "Unknown command. Use /help for available commands.");
    }

    #[tokio::test]
    async fn rename_keeps_file() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        say(&bot, &app, ADMIN, "/rename_file Heat Heat 1995").await;

        assert_eq!(last_text(&server).await, "Renamed 'Heat' to 'Heat 1995'.");
        assert!(app.storage.get_movie("Heat").await.unwrap().is_none());
        assert_eq!(app.storage.get_movie("Heat 1995").await.unwrap().unwrap().file_id, "file-Heat");
    }

    #[tokio::test]
    async fn rename_needs_two_names() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        say(&bot, &app, ADMIN, "/rename_file Heat").await;
        assert_eq!(last_text(&server).await, "Usage: /rename_file OldName NewName");
        say(&bot, &app, ADMIN, "/rename_file Ghost Other").await;
        assert_eq!(last_text(&server).await, "Movie 'Ghost' not found.");
    }

    #[tokio::test]
    async fn delete_existing_and_missing() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        say(&bot, &app, ADMIN, "/delete_file Heat").await;
        assert_eq!(last_text(&server).await, "Deleted 'Heat'.");
        say(&bot, &app, ADMIN, "/delete_file Heat").await;
        assert_eq!(last_text(&server).await, "Movie 'Heat' not found.");
    }

    #[tokio::test]
    async fn link_resolves_through_start() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "The Matrix").await;

        say(&bot, &app, ADMIN, "/get_movie_link The Matrix").await;
        assert_eq!(
            last_text(&server).await,
            "Click here to get the movie: https://t.me/vault_bot?start=The_Matrix"
        );

        say(&bot, &app, USER, "/start The_Matrix").await;
        assert_eq!(testing::calls(&server, "sendDocument").await, 1);
    }

    #[tokio::test]
    async fn underscore_name_link_resolves_through_start() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Mad_Max").await;

        say(&bot, &app, ADMIN, "/get_movie_link Mad_Max").await;
        let reply = last_text(&server).await;
        let payload = reply.rsplit("start=").next().unwrap().to_string();
        assert_eq!(payload, "Mad_Max");

        say(&bot, &app, USER, &format!("/start {payload}")).await;
        assert_eq!(testing::calls(&server, "sendDocument").await, 1);
    }

    #[tokio::test]
    async fn link_refused_for_mixed_separators() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::document(ADMIN, "doc-1"), &app).await.unwrap();
        say(&bot, &app, ADMIN, "Mad_Max Fury Road").await;
        // stored, but no link that /start could not resolve
        assert!(!last_text(&server).await.contains("start="));

        say(&bot, &app, ADMIN, "/get_movie_link Mad_Max Fury Road").await;
        assert!(last_text(&server).await.contains("cannot be used in a link"));
    }

    #[tokio::test]
    async fn link_refused_for_unencodable_name() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Amélie").await;

        say(&bot, &app, ADMIN, "/get_movie_link Amélie").await;
        assert!(last_text(&server).await.contains("cannot be used in a link"));
    }

    #[tokio::test]
    async fn list_files_shows_names_and_buttons() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;
        put(&app, "Alien").await;

        say(&bot, &app, ADMIN, "/list_files").await;

        let bodies = testing::bodies(&server, "sendMessage").await;
        assert_eq!(bodies[0]["text"], "<b>Stored Files (2):</b>\n• Alien\n• Heat");
        let buttons = &bodies[1]["reply_markup"]["inline_keyboard"];
        assert_eq!(buttons[0][0]["callback_data"], "link:Alien");
        assert_eq!(buttons[1][1]["callback_data"], "del:Heat");
    }

    #[tokio::test]
    async fn announce_reaches_known_users() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        say(&bot, &app, 7, "hello").await;
        say(&bot, &app, 8, "hello").await;

        say(&bot, &app, ADMIN, "/announce New movies tonight").await;

        let bodies = testing::bodies(&server, "sendMessage").await;
        let mut targets: Vec<_> = bodies
            .iter()
            .filter(|b| b["text"] == "New movies tonight")
            .map(|b| b["chat_id"].as_i64().unwrap())
            .collect();
        targets.sort();
        assert_eq!(targets, [7, 8]);
        assert!(last_text(&server).await.contains("Success: 2 users"));
    }

    #[tokio::test]
    async fn announce_escapes_html() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        say(&bot, &app, USER, "hello").await;

        say(&bot, &app, ADMIN, "/announce Tom & Jerry <3 tonight").await;

        let bodies = testing::bodies(&server, "sendMessage").await;
        let to_user: Vec<_> = bodies.iter().filter(|b| b["chat_id"] == USER).collect();
        assert_eq!(to_user.len(), 1);
        assert_eq!(to_user[0]["text"], "Tom &amp; Jerry &lt;3 tonight");
        assert_eq!(to_user[0]["parse_mode"], "HTML");
    }

    #[tokio::test]
    async fn stats_counts() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;
        say(&bot, &app, USER, "hi").await;

        say(&bot, &app, ADMIN, "/stats").await;
        assert_eq!(
            last_text(&server).await,
            "📊 Bot Statistics:\nTotal Movies: 1\nTotal Users: 1\nPending Deletions: 0"
        );
    }

    #[tokio::test]
    async fn callback_delete_removes_movie() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        on_callback(bot.clone(), testing::callback(ADMIN, "del:Heat"), &app).await.unwrap();

        assert!(app.storage.get_movie("Heat").await.unwrap().is_none());
        assert_eq!(testing::calls(&server, "answerCallbackQuery").await, 1);
        assert_eq!(last_text(&server).await, "No files stored.");
    }

    #[tokio::test]
    async fn callback_from_non_admin_is_refused() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;
        put(&app, "Heat").await;

        on_callback(bot.clone(), testing::callback(USER, "del:Heat"), &app).await.unwrap();

        assert!(app.storage.get_movie("Heat").await.unwrap().is_some());
        let answers = testing::bodies(&server, "answerCallbackQuery").await;
        assert_eq!(answers[0]["text"], NOT_AUTHORIZED);
    }

    #[tokio::test]
    async fn delivered_file_is_deleted_after_delay() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (bot, app) = setup(&server, &dir).await;

        on_message(bot.clone(), testing::document(ADMIN, "doc-1"), &app).await.unwrap();
        say(&bot, &app, ADMIN, "Heat").await;
        say(&bot, &app, USER, "/start Heat").await;

        assert_eq!(app.expiry.sweep(Utc::now()).await.deleted, 0);
        let report = app.expiry.sweep(Utc::now() + chrono::Duration::minutes(31)).await;
        assert_eq!(report.deleted, 1);
        // file and warning
        assert_eq!(testing::calls(&server, "deleteMessage").await, 2);
        assert_eq!(app.storage.stats().await.unwrap().pending_deletions, 0);
        // the movie itself stays
        assert!(app.storage.get_movie("Heat").await.unwrap().is_some());
    }

    #[test]
    fn keyboard_skips_long_names() {
        let movie = |name: &str| Movie { name: name.to_string(), file_id: "f".into(), kind: FileKind::Document };
        let kb = keyboard_list(&[movie("Heat"), movie(&"x".repeat(70))]);
        assert_eq!(kb.inline_keyboard.len(), 1);
    }

    #[test]
    fn split_keeps_lines_whole() {
        let parts = split_by_chars("aaaa\nbbbb\ncccc", 10);
        assert_eq!(parts, ["aaaa\nbbbb\n", "cccc"]);
    }

    #[test]
    fn process_usage_sees_cpu_work() {
        let busy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let spinner = {
            let busy = busy.clone();
            std::thread::spawn(move || {
                let mut n = 0u64;
                while busy.load(std::sync::atomic::Ordering::Relaxed) {
                    n = std::hint::black_box(n.wrapping_add(1));
                }
            })
        };

        let usage = process_usage();
        busy.store(false, std::sync::atomic::Ordering::Relaxed);
        spinner.join().unwrap();

        let (mem_mb, cpu) = usage.unwrap();
        assert!(mem_mb > 0.0);
        assert!(cpu > 0.0, "cpu {cpu}");
    }

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 5 * 60 + 7)), "3h 5m 7s");
    }
}
