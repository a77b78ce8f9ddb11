mod json;
mod mongo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::config::Config;

use json::JsonStore;
use mongo::MongoStore;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage snapshot is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("mongodb request failed: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("bson conversion failed: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// How a stored file has to be re-sent: Telegram refuses a video `file_id`
/// in `sendDocument` for some uploads, so the upload kind is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    Document,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub name: String,
    pub file_id: String,
    #[serde(default)]
    pub kind: FileKind,
}

/// A delivered file (plus its warning message) waiting to be removed from a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledDeletion {
    pub chat_id: i64,
    pub file_message_id: i32,
    #[serde(default)]
    pub warning_message_id: Option<i32>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub delete_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl ScheduledDeletion {
    pub fn message_ids(&self) -> impl Iterator<Item = i32> + '_ {
        std::iter::once(self.file_message_id).chain(self.warning_message_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delete_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    pub user_id: u64,
    pub display_name: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub movies: u64,
    pub users: u64,
    pub pending_deletions: u64,
}

#[derive(Clone)]
enum Backend {
    Json(JsonStore),
    Mongo(MongoStore),
}

/// Cheap to clone handle shared by the dispatcher and the expiry sweeper.
#[derive(Clone)]
pub struct Storage {
    backend: Backend,
}

impl Storage {
    pub async fn json(path: impl Into<PathBuf>) -> StorageResult<Self> {
        Ok(Self { backend: Backend::Json(JsonStore::open(path).await?) })
    }

    pub async fn mongo(uri: &str, database: &str) -> StorageResult<Self> {
        Ok(Self { backend: Backend::Mongo(MongoStore::connect(uri, database).await?) })
    }

    /// Opens the backend selected by the configuration. MongoDB gets a fixed
    /// number of connection attempts; the last error is returned to abort startup.
    pub async fn connect(config: &Config) -> StorageResult<Self> {
        let Some(uri) = config.mongodb_uri.as_deref() else {
            tracing::info!(path = %config.store_path.display(), "using json file storage");
            return Self::json(config.store_path.clone()).await;
        };

        let mut attempt = 1;
        loop {
            match Self::mongo(uri, &config.mongodb_database).await {
                Ok(storage) => {
                    tracing::info!(database = %config.mongodb_database, "mongodb connected");
                    return Ok(storage);
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "mongodb connection failed, retrying");
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempts = attempt, error = %e, "giving up on mongodb");
                    return Err(e);
                }
            }
        }
    }

    pub async fn get_movie(&self, name: &str) -> StorageResult<Option<Movie>> {
        match &self.backend {
            Backend::Json(s) => Ok(s.get_movie(name).await),
            Backend::Mongo(s) => s.get_movie(name).await,
        }
    }

    /// All movies ordered by name.
    pub async fn list_movies(&self) -> StorageResult<Vec<Movie>> {
        match &self.backend {
            Backend::Json(s) => Ok(s.list_movies().await),
            Backend::Mongo(s) => s.list_movies().await,
        }
    }

    /// Upsert. Returns `true` when an existing record was replaced.
    pub async fn put_movie(&self, movie: Movie) -> StorageResult<bool> {
        match &self.backend {
            Backend::Json(s) => s.put_movie(movie).await,
            Backend::Mongo(s) => s.put_movie(&movie).await,
        }
    }

    pub async fn delete_movie(&self, name: &str) -> StorageResult<bool> {
        match &self.backend {
            Backend::Json(s) => s.delete_movie(name).await,
            Backend::Mongo(s) => s.delete_movie(name).await,
        }
    }

    /// Moves the file reference from `old` to `new`. `false` when `old` does not exist.
    pub async fn rename_movie(&self, old: &str, new: &str) -> StorageResult<bool> {
        match &self.backend {
            Backend::Json(s) => s.rename_movie(old, new).await,
            Backend::Mongo(s) => s.rename_movie(old, new).await,
        }
    }

    pub async fn schedule_deletion(&self, record: ScheduledDeletion) -> StorageResult<()> {
        match &self.backend {
            Backend::Json(s) => s.schedule_deletion(record).await,
            Backend::Mongo(s) => s.schedule_deletion(&record).await,
        }
    }

    /// Records whose `delete_at` is not after `now`, oldest first.
    pub async fn due_deletions(&self, now: DateTime<Utc>) -> StorageResult<Vec<ScheduledDeletion>> {
        match &self.backend {
            Backend::Json(s) => Ok(s.due_deletions(now).await),
            Backend::Mongo(s) => s.due_deletions(now).await,
        }
    }

    pub async fn next_deletion_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match &self.backend {
            Backend::Json(s) => Ok(s.next_deletion_at().await),
            Backend::Mongo(s) => s.next_deletion_at().await,
        }
    }

    pub async fn remove_deletion(&self, chat_id: i64, file_message_id: i32) -> StorageResult<bool> {
        match &self.backend {
            Backend::Json(s) => s.remove_deletion(chat_id, file_message_id).await,
            Backend::Mongo(s) => s.remove_deletion(chat_id, file_message_id).await,
        }
    }

    /// Increments the failure counter of a record and returns the new value.
    pub async fn bump_deletion_attempts(&self, chat_id: i64, file_message_id: i32) -> StorageResult<u32> {
        match &self.backend {
            Backend::Json(s) => s.bump_deletion_attempts(chat_id, file_message_id).await,
            Backend::Mongo(s) => s.bump_deletion_attempts(chat_id, file_message_id).await,
        }
    }

    pub async fn upsert_user(&self, user: BotUser) -> StorageResult<()> {
        match &self.backend {
            Backend::Json(s) => s.upsert_user(user).await,
            Backend::Mongo(s) => s.upsert_user(&user).await,
        }
    }

    pub async fn list_users(&self) -> StorageResult<Vec<BotUser>> {
        match &self.backend {
            Backend::Json(s) => Ok(s.list_users().await),
            Backend::Mongo(s) => s.list_users().await,
        }
    }

    pub async fn stats(&self) -> StorageResult<Stats> {
        match &self.backend {
            Backend::Json(s) => Ok(s.stats().await),
            Backend::Mongo(s) => s.stats().await,
        }
    }
}
