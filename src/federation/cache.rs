//! Remote collection cache
//!
//! Mirrors remote posts into the store. Every row is insert-if-absent, so
//! writing the same payload twice leaves exactly one record and is not an
//! error.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use regex::Regex;

use super::envelope::Object;
use super::fetch::RemoteFetcher;
use super::resolver::ActorResolver;
use crate::data::{FederationStore, ObjectOrigin, ObjectRecord};
use crate::error::AppError;
use crate::metrics::CACHE_WRITES_TOTAL;

/// Result of writing one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Written,
    /// A row with this id was already stored
    Exists,
    /// Matched a denylist pattern; nothing stored
    Blacklisted,
}

impl CacheWrite {
    fn label(self) -> &'static str {
        match self {
            CacheWrite::Written => "written",
            CacheWrite::Exists => "exists",
            CacheWrite::Blacklisted => "blacklisted",
        }
    }
}

pub struct RemoteCache {
    store: Arc<dyn FederationStore>,
    fetcher: RemoteFetcher,
    resolver: Arc<ActorResolver>,
    blacklist: Vec<Regex>,
}

impl RemoteCache {
    pub fn new(
        store: Arc<dyn FederationStore>,
        fetcher: RemoteFetcher,
        resolver: Arc<ActorResolver>,
        patterns: &[String],
    ) -> Result<Self, AppError> {
        let blacklist = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| AppError::Config(format!("blacklist pattern {pattern:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            store,
            fetcher,
            resolver,
            blacklist,
        })
    }

    fn blacklist_match(&self, object: &Object) -> Option<&Regex> {
        self.blacklist
            .iter()
            .find(|pattern| pattern.is_match(&object.name) || pattern.is_match(&object.content))
    }

    /// Mirror a remote post, its attachments, preview and any replies it carries.
    pub async fn write_cache(&self, object: &Object) -> Result<CacheWrite, AppError> {
        self.write(object, ObjectOrigin::Cache).await
    }

    /// Store a post authored on this instance.
    pub(crate) async fn write_local(&self, object: &Object) -> Result<CacheWrite, AppError> {
        self.write(object, ObjectOrigin::Local).await
    }

    fn write<'a>(
        &'a self,
        object: &'a Object,
        origin: ObjectOrigin,
    ) -> BoxFuture<'a, Result<CacheWrite, AppError>> {
        Box::pin(async move {
            if let Some(pattern) = self.blacklist_match(object) {
                tracing::info!(id = %object.id, pattern = %pattern.as_str(), "Blacklisted post blocked");
                CACHE_WRITES_TOTAL
                    .with_label_values(&[CacheWrite::Blacklisted.label()])
                    .inc();
                return Ok(CacheWrite::Blacklisted);
            }

            if object.id.is_empty() {
                return Err(AppError::Validation("post without id".to_string()));
            }

            if let Some(preview) = object.preview.as_deref().filter(|p| !p.href.is_empty()) {
                self.store
                    .insert_if_absent(&record_from(preview, origin, "Preview"))
                    .await?;
            }
            for attachment in &object.attachment {
                if !attachment.id.is_empty() {
                    self.store
                        .insert_if_absent(&record_from(attachment, origin, "Attachment"))
                        .await?;
                }
            }

            let mut record = record_from(object, origin, "Note");
            record.attachment = object
                .attachment
                .first()
                .map(|a| a.id.clone())
                .unwrap_or_default();
            record.preview = object
                .preview
                .as_deref()
                .map(|p| p.id.clone())
                .unwrap_or_default();

            let outcome = if self.store.insert_if_absent(&record).await? {
                CacheWrite::Written
            } else {
                CacheWrite::Exists
            };
            CACHE_WRITES_TOTAL.with_label_values(&[outcome.label()]).inc();

            self.write_reply_edges(object, &record, outcome).await?;

            if let Some(replies) = object.replies.as_deref() {
                for reply in replies.members() {
                    self.write(reply, origin).await?;
                }
            }

            Ok(outcome)
        })
    }

    async fn write_reply_edges(
        &self,
        object: &Object,
        record: &ObjectRecord,
        outcome: CacheWrite,
    ) -> Result<(), AppError> {
        let Some(parent) = object.parent_id() else {
            self.store.insert_reply_edge(&object.id, "").await?;
            return Ok(());
        };

        if outcome == CacheWrite::Written && !self.store.is_thread_root(&object.id).await? {
            let parent_kind = self.store.get_object(parent).await?.map(|p| p.kind);
            if parent_kind.as_deref() == Some("Archive") {
                self.store.update_type(&object.id, "Archive").await?;
            }
        }

        self.store.insert_reply_edge(&object.id, parent).await?;

        let sage = object.has_option("sage") || object.has_option("nokosage");
        if outcome == CacheWrite::Written && !sage {
            self.store.set_updated(parent, record.published).await?;
        }

        Ok(())
    }

    /// Forget cached thread roots of an actor we no longer follow.
    pub async fn delete_cache(&self, actor_id: &str) -> Result<u64, AppError> {
        let removed = self.store.delete_cached_thread(actor_id).await?;
        tracing::info!(actor = %actor_id, removed, "Dropped cached threads");
        Ok(removed)
    }

    /// Mirror everything currently in a remote actor's outbox.
    pub async fn cache_actor_outbox(&self, actor_id: &str) -> Result<usize, AppError> {
        let actor = self.resolver.resolve(actor_id).await?;
        let outbox = if actor.outbox.is_empty() {
            format!("{}/outbox", actor.id)
        } else {
            actor.outbox.clone()
        };

        let collection = self.fetcher.get_collection(&outbox).await?;
        let mut written = 0;
        for post in collection.members() {
            if self.write_cache(post).await? == CacheWrite::Written {
                written += 1;
            }
        }

        tracing::info!(actor = %actor.id, written, "Mirrored remote outbox");
        Ok(written)
    }
}

fn record_from(object: &Object, origin: ObjectOrigin, default_kind: &str) -> ObjectRecord {
    let kind = if object.kind.is_empty() {
        default_kind
    } else {
        object.kind.as_str()
    };
    let published = object.published.unwrap_or_else(Utc::now);

    let mut record = ObjectRecord::new(object.id.clone(), kind, origin);
    record.name = html_escape::encode_text(&object.name).into_owned();
    record.content = html_escape::encode_text(&object.content).into_owned();
    record.attributed_to = html_escape::encode_text(&object.attributed_to).into_owned();
    record.actor = object.actor.clone();
    record.tripcode = object.tripcode.clone();
    record.href = object.href.clone();
    record.media_type = object.media_type.clone();
    record.size = object.size.unwrap_or_default();
    record.sensitive = object.sensitive;
    record.published = published;
    record.updated = object.updated.unwrap_or(published);
    record.deleted = object.deleted;
    record
}

/// Inverse of `record_from` for serving stored posts. Attachments and
/// previews are separate rows and are not filled in here.
pub(crate) fn object_from(record: &ObjectRecord) -> Object {
    Object {
        kind: record.kind.clone(),
        id: record.id.clone(),
        name: record.name.clone(),
        content: record.content.clone(),
        actor: record.actor.clone(),
        attributed_to: record.attributed_to.clone(),
        tripcode: record.tripcode.clone(),
        href: record.href.clone(),
        media_type: record.media_type.clone(),
        size: (record.size > 0).then_some(record.size),
        sensitive: record.sensitive,
        published: Some(record.published),
        updated: Some(record.updated),
        deleted: record.deleted,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use crate::federation::envelope::Collection;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    async fn cache(patterns: &[String]) -> (RemoteCache, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let fetcher = RemoteFetcher::new(reqwest::Client::new());
        let resolver = Arc::new(ActorResolver::new(db.clone(), fetcher.clone(), "http"));
        let cache = RemoteCache::new(db.clone(), fetcher, resolver, patterns).unwrap();
        (cache, db, temp_dir)
    }

    fn note(id: &str) -> Object {
        Object {
            kind: "Note".to_string(),
            id: id.to_string(),
            actor: "https://a.example/b".to_string(),
            content: "hello".to_string(),
            published: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    fn reply(id: &str, parent: &str) -> Object {
        Object {
            in_reply_to: vec![Object {
                id: parent.to_string(),
                ..Default::default()
            }],
            published: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            ..note(id)
        }
    }

    #[tokio::test]
    async fn writing_twice_stores_once() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let post = note("https://a.example/b/ROOT0001");

        assert_eq!(cache.write_cache(&post).await.unwrap(), CacheWrite::Written);
        assert_eq!(cache.write_cache(&post).await.unwrap(), CacheWrite::Exists);

        let stored = db.get_object(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.origin, ObjectOrigin::Cache);
        assert!(db.is_thread_root(&post.id).await.unwrap());
    }

    #[tokio::test]
    async fn blacklisted_content_is_not_stored() {
        let (cache, db, _temp_dir) = cache(&["(?i)buy now".to_string()]).await;
        let mut post = note("https://a.example/b/SPAM0001");
        post.content = "BUY NOW cheap".to_string();

        assert_eq!(cache.write_cache(&post).await.unwrap(), CacheWrite::Blacklisted);
        assert!(!db.object_exists(&post.id).await.unwrap());
    }

    #[tokio::test]
    async fn text_is_escaped() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let mut post = note("https://a.example/b/HTML0001");
        post.content = "<script>alert(1)</script>".to_string();

        cache.write_cache(&post).await.unwrap();
        let stored = db.get_object(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "&lt;script&gt;alert(1)&lt;/script&gt;");
    }

    #[tokio::test]
    async fn reply_bumps_parent_unless_sage() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let root = note("https://a.example/b/ROOT0001");
        cache.write_cache(&root).await.unwrap();

        let bump = reply("https://a.example/b/REPLY001", &root.id);
        cache.write_cache(&bump).await.unwrap();
        let stored_root = db.get_object(&root.id).await.unwrap().unwrap();
        assert_eq!(Some(stored_root.updated), bump.published);
        assert!(db.exists_reply_edge(&bump.id, &root.id).await.unwrap());

        let mut sage = reply("https://a.example/b/REPLY002", &root.id);
        sage.published = bump.published.map(|t| t + Duration::days(1));
        sage.option = vec!["sage".to_string()];
        cache.write_cache(&sage).await.unwrap();
        let stored_root = db.get_object(&root.id).await.unwrap().unwrap();
        assert_eq!(Some(stored_root.updated), bump.published);
    }

    #[tokio::test]
    async fn reply_to_archived_thread_is_archived() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let root = note("https://a.example/b/ROOT0001");
        cache.write_cache(&root).await.unwrap();
        db.update_type(&root.id, "Archive").await.unwrap();

        let late = reply("https://a.example/b/LATE0001", &root.id);
        cache.write_cache(&late).await.unwrap();

        let stored = db.get_object(&late.id).await.unwrap().unwrap();
        assert_eq!(stored.kind, "Archive");
    }

    #[tokio::test]
    async fn attachments_preview_and_nested_replies() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let mut root = note("https://a.example/b/ROOT0001");
        root.attachment = vec![Object {
            kind: "Attachment".to_string(),
            id: "https://a.example/b/FILE0001".to_string(),
            href: "https://a.example/public/file.png".to_string(),
            media_type: "image/png".to_string(),
            size: Some(1024),
            ..Default::default()
        }];
        root.preview = Some(Box::new(Object {
            kind: "Preview".to_string(),
            id: "https://a.example/b/PREV0001".to_string(),
            href: "https://a.example/public/thumb.png".to_string(),
            ..Default::default()
        }));
        root.replies = Some(Box::new(Collection {
            ordered_items: vec![reply("https://a.example/b/REPLY001", &root.id)],
            ..Default::default()
        }));

        cache.write_cache(&root).await.unwrap();

        let stored = db.get_object(&root.id).await.unwrap().unwrap();
        assert_eq!(stored.attachment, "https://a.example/b/FILE0001");
        assert_eq!(stored.preview, "https://a.example/b/PREV0001");

        let file = db.get_object(&stored.attachment).await.unwrap().unwrap();
        assert_eq!(file.size, 1024);
        assert!(db.object_exists("https://a.example/b/PREV0001").await.unwrap());
        assert_eq!(
            db.replies_of(&root.id).await.unwrap(),
            vec!["https://a.example/b/REPLY001"]
        );
    }

    #[tokio::test]
    async fn delete_cache_drops_roots() {
        let (cache, db, _temp_dir) = cache(&[]).await;
        let root = note("https://a.example/b/ROOT0001");
        cache.write_cache(&root).await.unwrap();

        assert_eq!(cache.delete_cache("https://a.example/b").await.unwrap(), 1);
        assert!(!db.object_exists(&root.id).await.unwrap());
    }
}
