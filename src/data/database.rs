//! SQLite database implementation
//!
//! All persistent data is stored in a single SQLite file and accessed
//! through `FederationStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::path::Path;

use super::models::{Actor, BoardOptions, ObjectOrigin, ObjectRecord, PublicKey};
use super::store::FederationStore;
use crate::error::AppError;

/// Database connection wrapper
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite database and run migrations
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Persistence(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }
}

fn actor_from_row(row: &SqliteRow) -> Result<Actor, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let public_key_id: String = row.try_get("public_key_id")?;
    let public_key = if public_key_id.is_empty() {
        None
    } else {
        Some(PublicKey {
            id: public_key_id,
            owner: id.clone(),
            public_key_pem: row.try_get("public_key_pem")?,
        })
    };

    Ok(Actor {
        id,
        kind: row.try_get("type")?,
        preferred_username: row.try_get("preferred_username")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        inbox: row.try_get("inbox")?,
        outbox: row.try_get("outbox")?,
        following: row.try_get("following")?,
        followers: row.try_get("followers")?,
        restricted: row.try_get("restricted")?,
        options_mask: BoardOptions(row.try_get("options_mask")?),
        public_key,
        auto_subscribe: row.try_get("auto_subscribe")?,
    })
}

fn object_from_row(row: &SqliteRow) -> Result<ObjectRecord, sqlx::Error> {
    let origin: String = row.try_get("origin")?;
    Ok(ObjectRecord {
        id: row.try_get("id")?,
        origin: ObjectOrigin::parse(&origin),
        kind: row.try_get("type")?,
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        actor: row.try_get("actor")?,
        attributed_to: row.try_get("attributed_to")?,
        tripcode: row.try_get("tripcode")?,
        href: row.try_get("href")?,
        media_type: row.try_get("media_type")?,
        size: row.try_get("size")?,
        attachment: row.try_get("attachment")?,
        preview: row.try_get("preview")?,
        sensitive: row.try_get("sensitive")?,
        published: row.try_get("published")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
    })
}

#[async_trait]
impl FederationStore for Database {
    // =========================================================================
    // Actors
    // =========================================================================

    async fn get_actor_by_id_or_name(&self, key: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query("SELECT * FROM actors WHERE id = ? OR preferred_username = ? LIMIT 1")
            .bind(key)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(actor_from_row).transpose()?)
    }

    async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        let (key_id, key_pem) = actor
            .public_key
            .as_ref()
            .map(|key| (key.id.as_str(), key.public_key_pem.as_str()))
            .unwrap_or(("", ""));

        sqlx::query(
            r#"
            INSERT INTO actors (
                id, type, preferred_username, name, summary, inbox, outbox,
                following, followers, restricted, options_mask, auto_subscribe,
                public_key_id, public_key_pem
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.kind)
        .bind(&actor.preferred_username)
        .bind(&actor.name)
        .bind(&actor.summary)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.following)
        .bind(&actor.followers)
        .bind(actor.restricted)
        .bind(actor.options_mask.0)
        .bind(actor.auto_subscribe)
        .bind(key_id)
        .bind(key_pem)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_options(&self, actor_id: &str, options: BoardOptions) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE actors SET options_mask = ? WHERE id = ?")
            .bind(options.0)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_auto_subscribe(&self, actor_id: &str, enabled: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE actors SET auto_subscribe = ? WHERE id = ?")
            .bind(enabled)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Key material
    // =========================================================================

    async fn get_key_file(&self, key_id: &str) -> Result<Option<String>, AppError> {
        let file = sqlx::query_scalar::<_, String>("SELECT file FROM key_files WHERE id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(file)
    }

    async fn insert_key_file(
        &self,
        key_id: &str,
        owner: &str,
        file: &str,
    ) -> Result<(), AppError> {
        sqlx::query("INSERT OR REPLACE INTO key_files (id, owner, file) VALUES (?, ?, ?)")
            .bind(key_id)
            .bind(owner)
            .bind(file)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Follow edges
    // =========================================================================

    async fn get_followers(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let followers = sqlx::query_scalar::<_, String>(
            "SELECT follower FROM followers WHERE id = ? ORDER BY rowid",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    async fn get_following(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let following = sqlx::query_scalar::<_, String>(
            "SELECT following FROM following WHERE id = ? ORDER BY rowid",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(following)
    }

    async fn is_following(&self, actor_id: &str, other: &str) -> Result<bool, AppError> {
        let found = sqlx::query("SELECT 1 FROM following WHERE id = ? AND following = ?")
            .bind(actor_id)
            .bind(other)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn is_follower(&self, actor_id: &str, other: &str) -> Result<bool, AppError> {
        let found = sqlx::query("SELECT 1 FROM followers WHERE id = ? AND follower = ?")
            .bind(actor_id)
            .bind(other)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn add_follower(&self, actor_id: &str, follower: &str) -> Result<bool, AppError> {
        let result = sqlx::query("INSERT OR IGNORE INTO followers (id, follower) VALUES (?, ?)")
            .bind(actor_id)
            .bind(follower)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_follower(&self, actor_id: &str, follower: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM followers WHERE id = ? AND follower = ?")
            .bind(actor_id)
            .bind(follower)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_following(&self, actor_id: &str, following: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO following (id, following) VALUES (?, ?)")
                .bind(actor_id)
                .bind(following)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_following(&self, actor_id: &str, following: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM following WHERE id = ? AND following = ?")
            .bind(actor_id)
            .bind(following)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    async fn insert_if_absent(&self, record: &ObjectRecord) -> Result<bool, AppError> {
        // The primary key arbitrates concurrent writers of the same id.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO objects (
                id, origin, type, name, content, actor, attributed_to, tripcode,
                href, media_type, size, attachment, preview, sensitive,
                published, updated, deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.origin.as_str())
        .bind(&record.kind)
        .bind(&record.name)
        .bind(&record.content)
        .bind(&record.actor)
        .bind(&record.attributed_to)
        .bind(&record.tripcode)
        .bind(&record.href)
        .bind(&record.media_type)
        .bind(record.size)
        .bind(&record.attachment)
        .bind(&record.preview)
        .bind(record.sensitive)
        .bind(record.published)
        .bind(record.updated)
        .bind(record.deleted)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn object_exists(&self, id: &str) -> Result<bool, AppError> {
        let found = sqlx::query("SELECT 1 FROM objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn get_object(&self, id: &str) -> Result<Option<ObjectRecord>, AppError> {
        let row = sqlx::query("SELECT * FROM objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(object_from_row).transpose()?)
    }

    async fn update_type(&self, id: &str, kind: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE objects SET type = ? WHERE id = ? AND type != 'Tombstone'")
                .bind(kind)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_updated(&self, id: &str, updated: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE objects SET updated = ? WHERE id = ?")
            .bind(updated)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn tombstone(&self, id: &str, at: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE objects
            SET type = 'Tombstone', name = '', content = '', attributed_to = 'deleted',
                tripcode = '', href = '', deleted = ?
            WHERE id = ?
               OR id IN (SELECT attachment FROM objects WHERE id = ? AND attachment != '')
               OR id IN (SELECT preview FROM objects WHERE id = ? AND preview != '')
            "#,
        )
        .bind(at)
        .bind(id)
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Reply edges
    // =========================================================================

    async fn exists_reply_edge(&self, id: &str, in_reply_to: &str) -> Result<bool, AppError> {
        let found = sqlx::query("SELECT 1 FROM replies WHERE id = ? AND in_reply_to = ?")
            .bind(id)
            .bind(in_reply_to)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn insert_reply_edge(&self, id: &str, in_reply_to: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO replies (id, in_reply_to) VALUES (?, ?)")
                .bind(id)
                .bind(in_reply_to)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_thread_root(&self, id: &str) -> Result<bool, AppError> {
        self.exists_reply_edge(id, "").await
    }

    async fn replies_of(&self, id: &str) -> Result<Vec<String>, AppError> {
        let replies = sqlx::query_scalar::<_, String>(
            r#"
            SELECT r.id FROM replies r
            JOIN objects o ON o.id = r.id
            WHERE r.in_reply_to = ?
            ORDER BY o.published
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(replies)
    }

    // =========================================================================
    // Threads
    // =========================================================================

    async fn is_locked(&self, id: &str) -> Result<bool, AppError> {
        let found = sqlx::query("SELECT 1 FROM locked WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    async fn toggle_locked(&self, actor_id: &str, id: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM locked WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let locked = if removed.rows_affected() > 0 {
            false
        } else {
            sqlx::query("INSERT INTO locked (id, actor) VALUES (?, ?)")
                .bind(id)
                .bind(actor_id)
                .execute(&mut *tx)
                .await?;
            true
        };

        tx.commit().await?;
        Ok(locked)
    }

    async fn board_threads(
        &self,
        actor_id: &str,
        kind: &str,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, AppError> {
        // SQLite needs a LIMIT to accept OFFSET; -1 means unbounded.
        let threads = sqlx::query_scalar::<_, String>(
            r#"
            SELECT o.id FROM objects o
            JOIN replies r ON r.id = o.id AND r.in_reply_to = ''
            WHERE o.type = ?
              AND (o.actor = ? OR o.actor IN (SELECT following FROM following WHERE id = ?))
            ORDER BY o.updated DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(kind)
        .bind(actor_id)
        .bind(actor_id)
        .bind(limit.unwrap_or(-1))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(threads)
    }

    async fn delete_cached_thread(&self, actor_id: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let roots = sqlx::query_scalar::<_, String>(
            r#"
            SELECT o.id FROM objects o
            JOIN replies r ON r.id = o.id AND r.in_reply_to = ''
            WHERE o.origin = 'cache' AND o.actor = ?
            "#,
        )
        .bind(actor_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0;
        for root in &roots {
            removed += sqlx::query("DELETE FROM objects WHERE id = ?")
                .bind(root)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM replies WHERE id = ? AND in_reply_to = ''")
                .bind(root)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }
}
