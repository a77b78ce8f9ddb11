use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use teloxide::{
    prelude::*,
    types::{ChatId, MessageId},
};
use tokio::sync::Notify;

use crate::discord::{Channel, DiscordLogger};
use crate::storage::{ScheduledDeletion, Storage, StorageResult};
use crate::telegram;

/// A record failing this many sweeps in a row is dropped.
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub retrying: usize,
    pub dropped: usize,
}

/// Deletes delivered files once their lifetime is over.
///
/// Every delivery is persisted as a [`ScheduledDeletion`] before anything
/// waits on it, so a restart only delays deletions: the first sweep after
/// startup picks up everything that fell due in the meantime. Records whose
/// messages could not be deleted stay in the store and are retried on the
/// following sweeps.
#[derive(Clone)]
pub struct Expiry {
    bot: Bot,
    storage: Storage,
    discord: DiscordLogger,
    delay: Duration,
    poll: Duration,
    wake: Arc<Notify>,
}

impl Expiry {
    pub fn new(bot: Bot, storage: Storage, discord: DiscordLogger, delay: Duration, poll: Duration) -> Self {
        Self { bot, storage, discord, delay, poll, wake: Arc::new(Notify::new()) }
    }

    /// Persists the deletion of a delivered file and its warning message.
    pub async fn schedule(
        &self,
        chat: ChatId,
        file_message: MessageId,
        warning_message: Option<MessageId>,
    ) -> StorageResult<ScheduledDeletion> {
        let now = Utc::now();
        let delete_at = chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = ScheduledDeletion {
            chat_id: chat.0,
            file_message_id: file_message.0,
            warning_message_id: warning_message.map(|m| m.0),
            delete_at,
            attempts: 0,
        };
        self.storage.schedule_deletion(record.clone()).await?;
        self.wake.notify_one();
        Ok(record)
    }

    /// Processes every record due at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let due = match self.storage.due_deletions(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "loading due deletions failed");
                self.discord.log(Channel::Status, format!("Loading scheduled deletions failed: {e}"));
                return report;
            }
        };

        for record in due {
            let chat = ChatId(record.chat_id);
            let mut gone = true;
            for id in record.message_ids() {
                gone &= telegram::delete_message(&self.bot, chat, MessageId(id)).await;
            }

            let outcome = if gone {
                self.storage.remove_deletion(record.chat_id, record.file_message_id).await.map(|_| {
                    report.deleted += 1;
                })
            } else {
                self.retry_or_drop(&record, &mut report).await
            };
            if let Err(e) = outcome {
                tracing::error!(chat_id = record.chat_id, error = %e, "updating deletion record failed");
            }
        }

        if report != SweepReport::default() {
            tracing::info!(?report, "deletion sweep finished");
        }
        report
    }

    async fn retry_or_drop(&self, record: &ScheduledDeletion, report: &mut SweepReport) -> StorageResult<()> {
        let attempts = self.storage.bump_deletion_attempts(record.chat_id, record.file_message_id).await?;
        if attempts < MAX_ATTEMPTS {
            report.retrying += 1;
            return Ok(());
        }
        self.storage.remove_deletion(record.chat_id, record.file_message_id).await?;
        report.dropped += 1;
        self.discord.log(
            Channel::Status,
            format!(
                "Gave up deleting message {} in chat {} after {attempts} attempts",
                record.file_message_id, record.chat_id
            ),
        );
        Ok(())
    }

    /// How long to sleep before the next sweep: until the earliest future
    /// record, but never longer than the poll interval. Overdue leftovers
    /// (failed deletions) wait a full interval.
    async fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        match self.storage.next_deletion_at().await {
            Ok(Some(at)) if at > now => (at - now).to_std().unwrap_or(self.poll).min(self.poll),
            Ok(_) => self.poll,
            Err(e) => {
                tracing::warn!(error = %e, "reading next deletion failed");
                self.poll
            }
        }
    }

    /// Sweeps forever. Wakes early when a new deletion is scheduled.
    pub async fn run(self) {
        tracing::info!(delay = ?self.delay, poll = ?self.poll, "deletion sweeper started");
        loop {
            self.sweep(Utc::now()).await;
            let wait = self.next_wait(Utc::now()).await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }
    }
}
