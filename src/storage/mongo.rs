use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson},
    options::{
        ClientOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions, IndexOptions,
        ReturnDocument, UpdateOptions,
    },
    Client, Collection, IndexModel,
};
use std::time::Duration;

use super::{BotUser, Movie, ScheduledDeletion, Stats, StorageResult};

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// `movies`, `deletions` and `users` collections of one database.
#[derive(Clone)]
pub struct MongoStore {
    movies: Collection<Movie>,
    deletions: Collection<ScheduledDeletion>,
    users: Collection<BotUser>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> StorageResult<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        let client = Client::with_options(options)?;
        let db = client.database(database);

        // fail fast when the server is unreachable
        db.run_command(doc! { "ping": 1 }, None).await?;

        let movies = db.collection::<Movie>("movies");
        let deletions = db.collection::<ScheduledDeletion>("deletions");
        let users = db.collection::<BotUser>("users");

        let unique = || IndexOptions::builder().unique(true).build();
        movies
            .create_index(IndexModel::builder().keys(doc! { "name": 1 }).options(unique()).build(), None)
            .await?;
        deletions
            .create_index(IndexModel::builder().keys(doc! { "delete_at": 1 }).build(), None)
            .await?;
        deletions
            .create_index(
                IndexModel::builder().keys(doc! { "chat_id": 1, "file_message_id": 1 }).build(),
                None,
            )
            .await?;
        users
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1 }).options(unique()).build(), None)
            .await?;

        Ok(Self { movies, deletions, users })
    }

    pub async fn get_movie(&self, name: &str) -> StorageResult<Option<Movie>> {
        Ok(self.movies.find_one(doc! { "name": name }, None).await?)
    }

    pub async fn list_movies(&self) -> StorageResult<Vec<Movie>> {
        let options = FindOptions::builder().sort(doc! { "name": 1 }).build();
        let cursor = self.movies.find(doc! {}, options).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn put_movie(&self, movie: &Movie) -> StorageResult<bool> {
        let update = doc! {
            "$set": { "file_id": movie.file_id.as_str(), "kind": to_bson(&movie.kind)? }
        };
        let upsert = UpdateOptions::builder().upsert(true).build();
        let result = self.movies.update_one(doc! { "name": movie.name.as_str() }, update, upsert).await?;
        Ok(result.matched_count > 0)
    }

    pub async fn delete_movie(&self, name: &str) -> StorageResult<bool> {
        let result = self.movies.delete_one(doc! { "name": name }, None).await?;
        Ok(result.deleted_count > 0)
    }

    // Not atomic: a crash between the write and the delete leaves both names.
    pub async fn rename_movie(&self, old: &str, new: &str) -> StorageResult<bool> {
        let Some(movie) = self.get_movie(old).await? else {
            return Ok(false);
        };
        if old == new {
            return Ok(true);
        }
        self.put_movie(&Movie { name: new.to_string(), ..movie }).await?;
        self.delete_movie(old).await?;
        Ok(true)
    }

    pub async fn schedule_deletion(&self, record: &ScheduledDeletion) -> StorageResult<()> {
        self.deletions.insert_one(record, None).await?;
        Ok(())
    }

    pub async fn due_deletions(&self, now: DateTime<Utc>) -> StorageResult<Vec<ScheduledDeletion>> {
        let options = FindOptions::builder().sort(doc! { "delete_at": 1 }).build();
        let cursor = self
            .deletions
            .find(doc! { "delete_at": { "$lte": now.timestamp() } }, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn next_deletion_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let options = FindOneOptions::builder().sort(doc! { "delete_at": 1 }).build();
        let next = self.deletions.find_one(doc! {}, options).await?;
        Ok(next.map(|d| d.delete_at))
    }

    pub async fn remove_deletion(&self, chat_id: i64, file_message_id: i32) -> StorageResult<bool> {
        let result = self
            .deletions
            .delete_one(doc! { "chat_id": chat_id, "file_message_id": file_message_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn bump_deletion_attempts(&self, chat_id: i64, file_message_id: i32) -> StorageResult<u32> {
        let options = FindOneAndUpdateOptions::builder().return_document(ReturnDocument::After).build();
        let updated = self
            .deletions
            .find_one_and_update(
                doc! { "chat_id": chat_id, "file_message_id": file_message_id },
                doc! { "$inc": { "attempts": 1 } },
                options,
            )
            .await?;
        Ok(updated.map(|d| d.attempts).unwrap_or(0))
    }

    pub async fn upsert_user(&self, user: &BotUser) -> StorageResult<()> {
        let update = doc! {
            "$set": {
                "display_name": user.display_name.as_str(),
                "last_seen": user.last_seen.timestamp(),
            }
        };
        let upsert = UpdateOptions::builder().upsert(true).build();
        self.users
            .update_one(doc! { "user_id": user.user_id as i64 }, update, upsert)
            .await?;
        Ok(())
    }

    pub async fn list_users(&self) -> StorageResult<Vec<BotUser>> {
        let options = FindOptions::builder().sort(doc! { "user_id": 1 }).build();
        let cursor = self.users.find(doc! {}, options).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn stats(&self) -> StorageResult<Stats> {
        Ok(Stats {
            movies: self.movies.count_documents(doc! {}, None).await?,
            users: self.users.count_documents(doc! {}, None).await?,
            pending_deletions: self.deletions.count_documents(doc! {}, None).await?,
        })
    }
}
