//! Thread archival and locking

use std::sync::Arc;

use crate::data::{Actor, FederationStore};
use crate::error::AppError;

pub struct Archiver {
    store: Arc<dyn FederationStore>,
    thread_limit: i64,
}

impl Archiver {
    pub fn new(store: Arc<dyn FederationStore>, thread_limit: i64) -> Self {
        Self {
            store,
            thread_limit,
        }
    }

    /// Archive every live thread past the newest `thread_limit`.
    ///
    /// The main actor and read-only boards only aggregate other boards'
    /// threads, so they never rotate.
    pub async fn archive_posts(&self, actor: &Actor) -> Result<usize, AppError> {
        if actor.id.is_empty() || actor.is_main() || actor.is_read_only() {
            return Ok(0);
        }

        let stale = self
            .store
            .board_threads(&actor.id, "Note", self.thread_limit, None)
            .await?;

        for root in &stale {
            self.retype_thread(root, "Archive").await?;
        }

        if !stale.is_empty() {
            tracing::info!(actor = %actor.id, threads = stale.len(), "Archived threads");
        }
        Ok(stale.len())
    }

    /// Bring the most recently updated archived thread back to life.
    pub async fn unarchive_last(&self, actor: &Actor) -> Result<Option<String>, AppError> {
        let latest = self
            .store
            .board_threads(&actor.id, "Archive", 0, Some(1))
            .await?
            .into_iter()
            .next();

        if let Some(root) = &latest {
            self.retype_thread(root, "Note").await?;
            tracing::info!(actor = %actor.id, thread = %root, "Unarchived thread");
        }
        Ok(latest)
    }

    async fn retype_thread(&self, root: &str, kind: &str) -> Result<(), AppError> {
        for reply in self.store.replies_of(root).await? {
            self.store.update_type(&reply, kind).await?;
        }
        self.store.update_type(root, kind).await?;
        Ok(())
    }

    /// Flip the lock on a thread root. Returns the new state.
    pub async fn toggle_locked(&self, actor_id: &str, id: &str) -> Result<bool, AppError> {
        if !self.store.is_thread_root(id).await? {
            return Err(AppError::Validation(format!("{id} is not a thread root")));
        }
        self.store.toggle_locked(actor_id, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BoardOptions, Database, ObjectOrigin, ObjectRecord};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    async fn board_with_threads(count: i64) -> (Archiver, Arc<Database>, Actor, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let board = Actor::new_board("https://chan.example", "g", "Technology", "");
        db.insert_actor(&board).await.unwrap();

        let base = Utc::now();
        for i in 0..count {
            let mut root = ObjectRecord::new(
                format!("{}/ROOT{:04}", board.id, i),
                "Note",
                ObjectOrigin::Local,
            );
            root.actor = board.id.clone();
            root.updated = base + Duration::seconds(i);
            db.insert_if_absent(&root).await.unwrap();
            db.insert_reply_edge(&root.id, "").await.unwrap();

            let mut reply = ObjectRecord::new(
                format!("{}/REPL{:04}", board.id, i),
                "Note",
                ObjectOrigin::Local,
            );
            reply.actor = board.id.clone();
            db.insert_if_absent(&reply).await.unwrap();
            db.insert_reply_edge(&reply.id, &root.id).await.unwrap();
        }

        (Archiver::new(db.clone(), 2), db, board, temp_dir)
    }

    async fn kind_of(db: &Database, id: &str) -> String {
        db.get_object(id).await.unwrap().unwrap().kind
    }

    #[tokio::test]
    async fn threads_past_the_limit_are_archived_with_replies() {
        let (archiver, db, board, _temp_dir) = board_with_threads(4).await;

        assert_eq!(archiver.archive_posts(&board).await.unwrap(), 2);

        assert_eq!(kind_of(&db, "https://chan.example/g/ROOT0003").await, "Note");
        assert_eq!(kind_of(&db, "https://chan.example/g/ROOT0002").await, "Note");
        assert_eq!(kind_of(&db, "https://chan.example/g/ROOT0001").await, "Archive");
        assert_eq!(kind_of(&db, "https://chan.example/g/REPL0000").await, "Archive");

        let restored = archiver.unarchive_last(&board).await.unwrap();
        assert_eq!(restored.as_deref(), Some("https://chan.example/g/ROOT0001"));
        assert_eq!(kind_of(&db, "https://chan.example/g/REPL0001").await, "Note");
        assert_eq!(kind_of(&db, "https://chan.example/g/ROOT0000").await, "Archive");
    }

    #[tokio::test]
    async fn read_only_and_main_actors_never_rotate() {
        let (archiver, _db, mut board, _temp_dir) = board_with_threads(4).await;

        board.options_mask = BoardOptions::READ_ONLY;
        assert_eq!(archiver.archive_posts(&board).await.unwrap(), 0);

        let main = Actor::new_board("https://chan.example", "main", "Main", "");
        assert_eq!(archiver.archive_posts(&main).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_roots_can_be_locked() {
        let (archiver, db, board, _temp_dir) = board_with_threads(1).await;

        assert!(
            archiver
                .toggle_locked(&board.id, "https://chan.example/g/ROOT0000")
                .await
                .unwrap()
        );
        assert!(db.is_locked("https://chan.example/g/ROOT0000").await.unwrap());

        assert!(matches!(
            archiver
                .toggle_locked(&board.id, "https://chan.example/g/REPL0000")
                .await,
            Err(AppError::Validation(_))
        ));
    }
}
