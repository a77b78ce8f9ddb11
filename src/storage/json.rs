use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{BotUser, FileKind, Movie, ScheduledDeletion, Stats, StorageResult};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFile {
    file_id: String,
    #[serde(default)]
    kind: FileKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileState {
    version: u32,
    // name -> file
    #[serde(default)]
    movies: BTreeMap<String, StoredFile>,
    #[serde(default)]
    deletions: Vec<ScheduledDeletion>,
    // user_id -> user
    #[serde(default)]
    users: HashMap<u64, BotUser>,
}

impl FileState {
    fn empty() -> Self {
        Self { version: FORMAT_VERSION, ..Default::default() }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Current(FileState),
    // `{name: {file_id, link}}` without any other tables
    Flat(BTreeMap<String, StoredFile>),
}

/// Whole-state snapshot file. Every mutation rewrites the file atomically.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<RwLock<FileState>>,
    // flushes share the temp file
    flushing: Arc<Mutex<()>>,
    path: PathBuf,
}

impl JsonStore {
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path).await.unwrap_or(false) {
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<OnDisk>(&data) {
                Ok(OnDisk::Current(mut s)) => {
                    if s.version == 0 {
                        s.version = FORMAT_VERSION;
                    }
                    s
                }
                Ok(OnDisk::Flat(movies)) => {
                    tracing::info!(path = %path.display(), movies = movies.len(), "migrating flat storage file");
                    FileState { movies, ..FileState::empty() }
                }
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    fs::rename(&path, &aside).await?;
                    tracing::warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "unreadable storage file moved aside, starting empty"
                    );
                    FileState::empty()
                }
            }
        } else {
            FileState::empty()
        };
        Ok(Self { inner: Arc::new(RwLock::new(state)), flushing: Arc::new(Mutex::new(())), path })
    }

    pub async fn get_movie(&self, name: &str) -> Option<Movie> {
        let guard = self.inner.read().await;
        guard.movies.get(name).map(|f| to_movie(name, f))
    }

    pub async fn list_movies(&self) -> Vec<Movie> {
        let guard = self.inner.read().await;
        guard.movies.iter().map(|(name, f)| to_movie(name, f)).collect()
    }

    pub async fn put_movie(&self, movie: Movie) -> StorageResult<bool> {
        let replaced = {
            let mut guard = self.inner.write().await;
            guard
                .movies
                .insert(movie.name, StoredFile { file_id: movie.file_id, kind: movie.kind })
                .is_some()
        };
        self.flush().await?;
        Ok(replaced)
    }

    pub async fn delete_movie(&self, name: &str) -> StorageResult<bool> {
        let removed = self.inner.write().await.movies.remove(name).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn rename_movie(&self, old: &str, new: &str) -> StorageResult<bool> {
        let renamed = {
            let mut guard = self.inner.write().await;
            match guard.movies.remove(old) {
                Some(file) => {
                    guard.movies.insert(new.to_string(), file);
                    true
                }
                None => false,
            }
        };
        if renamed {
            self.flush().await?;
        }
        Ok(renamed)
    }

    pub async fn schedule_deletion(&self, record: ScheduledDeletion) -> StorageResult<()> {
        self.inner.write().await.deletions.push(record);
        self.flush().await
    }

    pub async fn due_deletions(&self, now: DateTime<Utc>) -> Vec<ScheduledDeletion> {
        let guard = self.inner.read().await;
        let mut due: Vec<_> = guard.deletions.iter().filter(|d| d.is_due(now)).cloned().collect();
        due.sort_by_key(|d| d.delete_at);
        due
    }

    pub async fn next_deletion_at(&self) -> Option<DateTime<Utc>> {
        let guard = self.inner.read().await;
        guard.deletions.iter().map(|d| d.delete_at).min()
    }

    pub async fn remove_deletion(&self, chat_id: i64, file_message_id: i32) -> StorageResult<bool> {
        let removed = {
            let mut guard = self.inner.write().await;
            let before = guard.deletions.len();
            guard
                .deletions
                .retain(|d| !(d.chat_id == chat_id && d.file_message_id == file_message_id));
            guard.deletions.len() < before
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn bump_deletion_attempts(&self, chat_id: i64, file_message_id: i32) -> StorageResult<u32> {
        let attempts = {
            let mut guard = self.inner.write().await;
            guard
                .deletions
                .iter_mut()
                .find(|d| d.chat_id == chat_id && d.file_message_id == file_message_id)
                .map(|d| {
                    d.attempts += 1;
                    d.attempts
                })
        };
        match attempts {
            Some(n) => {
                self.flush().await?;
                Ok(n)
            }
            None => Ok(0),
        }
    }

    pub async fn upsert_user(&self, user: BotUser) -> StorageResult<()> {
        self.inner.write().await.users.insert(user.user_id, user);
        self.flush().await
    }

    pub async fn list_users(&self) -> Vec<BotUser> {
        let guard = self.inner.read().await;
        let mut users: Vec<_> = guard.users.values().cloned().collect();
        users.sort_by_key(|u| u.user_id);
        users
    }

    pub async fn stats(&self) -> Stats {
        let guard = self.inner.read().await;
        Stats {
            movies: guard.movies.len() as u64,
            users: guard.users.len() as u64,
            pending_deletions: guard.deletions.len() as u64,
        }
    }

    async fn flush(&self) -> StorageResult<()> {
        let _flushing = self.flushing.lock().await;
        // taken after the flush lock so the last writer persists the newest state
        let snapshot = {
            let guard = self.inner.read().await;
            serde_json::to_vec_pretty(&*guard)?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &snapshot).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn to_movie(name: &str, file: &StoredFile) -> Movie {
    Movie { name: name.to_string(), file_id: file.file_id.clone(), kind: file.kind }
}
