use moka::future::Cache;
use std::time::Duration;
use teloxide::types::{ChatId, UserId};

use crate::storage::FileKind;

const MAX_TRACKED: u64 = 10_000;

/// A file the admin has uploaded but not named yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub file_id: String,
    pub kind: FileKind,
}

/// chat -> upload waiting for its name. Entries expire on their own so an
/// abandoned upload does not swallow a much later text message.
#[derive(Clone)]
pub struct PendingUploads {
    inner: Cache<ChatId, PendingUpload>,
}

impl PendingUploads {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Cache::builder().max_capacity(MAX_TRACKED).time_to_live(ttl).build() }
    }

    /// Replaces any earlier upload of the same chat.
    pub async fn remember(&self, chat: ChatId, upload: PendingUpload) {
        self.inner.insert(chat, upload).await;
    }

    pub async fn take(&self, chat: ChatId) -> Option<PendingUpload> {
        // `get` honours the ttl even before the entry is evicted
        let upload = self.inner.get(&chat).await?;
        self.inner.invalidate(&chat).await;
        Some(upload)
    }
}

/// Per-user throttle for public requests.
#[derive(Clone)]
pub struct Cooldowns {
    inner: Option<Cache<UserId, ()>>,
}

impl Cooldowns {
    pub fn new(window: Duration) -> Self {
        let inner = (!window.is_zero())
            .then(|| Cache::builder().max_capacity(MAX_TRACKED).time_to_live(window).build());
        Self { inner }
    }

    /// `true` if the user may proceed; starts a new window in that case.
    pub async fn try_acquire(&self, user: UserId) -> bool {
        match &self.inner {
            Some(cache) => cache.entry(user).or_insert(()).await.is_fresh(),
            None => true,
        }
    }
}
