//! Storage interface for the federation core
//!
//! The federation logic only talks to `FederationStore`; the SQLite
//! implementation lives in `database.rs`. Every method is an independent
//! atomic operation. Insert-style methods report whether a row was
//! actually written, which is what makes cache writes idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Actor, BoardOptions, ObjectRecord};
use crate::error::AppError;

#[async_trait]
pub trait FederationStore: Send + Sync {
    // ---- actors -----------------------------------------------------------

    /// Look up a local actor by id or preferred username.
    async fn get_actor_by_id_or_name(&self, key: &str) -> Result<Option<Actor>, AppError>;
    async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError>;
    async fn set_options(&self, actor_id: &str, options: BoardOptions) -> Result<bool, AppError>;
    async fn set_auto_subscribe(&self, actor_id: &str, enabled: bool) -> Result<bool, AppError>;

    // ---- key material -----------------------------------------------------

    /// Public key file path recorded for a key id.
    async fn get_key_file(&self, key_id: &str) -> Result<Option<String>, AppError>;
    async fn insert_key_file(&self, key_id: &str, owner: &str, file: &str)
    -> Result<(), AppError>;

    // ---- follow edges -----------------------------------------------------

    async fn get_followers(&self, actor_id: &str) -> Result<Vec<String>, AppError>;
    async fn get_following(&self, actor_id: &str) -> Result<Vec<String>, AppError>;
    /// Whether `actor_id` follows `other`.
    async fn is_following(&self, actor_id: &str, other: &str) -> Result<bool, AppError>;
    /// Whether `other` is recorded as a follower of `actor_id`.
    async fn is_follower(&self, actor_id: &str, other: &str) -> Result<bool, AppError>;
    async fn add_follower(&self, actor_id: &str, follower: &str) -> Result<bool, AppError>;
    async fn remove_follower(&self, actor_id: &str, follower: &str) -> Result<bool, AppError>;
    async fn add_following(&self, actor_id: &str, following: &str) -> Result<bool, AppError>;
    async fn remove_following(&self, actor_id: &str, following: &str) -> Result<bool, AppError>;

    // ---- objects ----------------------------------------------------------

    /// Insert unless a row with the same id exists. Returns `true` if written.
    async fn insert_if_absent(&self, record: &ObjectRecord) -> Result<bool, AppError>;
    async fn object_exists(&self, id: &str) -> Result<bool, AppError>;
    async fn get_object(&self, id: &str) -> Result<Option<ObjectRecord>, AppError>;
    /// Change an object's type. Tombstones are never overwritten.
    async fn update_type(&self, id: &str, kind: &str) -> Result<bool, AppError>;
    async fn set_updated(&self, id: &str, updated: DateTime<Utc>) -> Result<bool, AppError>;
    /// Tombstone an object together with its attachment and preview rows.
    async fn tombstone(&self, id: &str, at: DateTime<Utc>) -> Result<u64, AppError>;

    // ---- reply edges ------------------------------------------------------

    async fn exists_reply_edge(&self, id: &str, in_reply_to: &str) -> Result<bool, AppError>;
    async fn insert_reply_edge(&self, id: &str, in_reply_to: &str) -> Result<bool, AppError>;
    /// A thread root carries the edge `(id, "")`.
    async fn is_thread_root(&self, id: &str) -> Result<bool, AppError>;
    async fn replies_of(&self, id: &str) -> Result<Vec<String>, AppError>;

    // ---- threads ----------------------------------------------------------

    async fn is_locked(&self, id: &str) -> Result<bool, AppError>;
    /// Flip the lock on a thread. Returns the new state.
    async fn toggle_locked(&self, actor_id: &str, id: &str) -> Result<bool, AppError>;

    /// Thread roots of `kind` owned by the actor or by actors it follows,
    /// newest `updated` first.
    async fn board_threads(
        &self,
        actor_id: &str,
        kind: &str,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, AppError>;

    /// Remove cached thread roots authored by `actor_id`. Returns rows removed.
    async fn delete_cached_thread(&self, actor_id: &str) -> Result<u64, AppError>;
}
