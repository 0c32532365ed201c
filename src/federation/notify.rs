//! Notification hook for newly mirrored posts

use async_trait::async_trait;

use super::envelope::Object;
use crate::data::Actor;

/// Told about each inbound post that was persisted for a local board.
///
/// Called from a detached task; failures are logged by the implementation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_received(&self, board: &Actor, post: &Object);
}

/// Emits one structured event per post.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post_received(&self, board: &Actor, post: &Object) {
        tracing::info!(
            board = %board.id,
            post = %post.id,
            author = %post.actor,
            reply_to = post.parent_id().unwrap_or_default(),
            "New post mirrored"
        );
    }
}
