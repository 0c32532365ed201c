//! ActivityPub federation module
//!
//! Handles:
//! - Envelope decoding
//! - HTTP Signatures and key material
//! - Actor resolution (store, cache, WebFinger, remote fetch)
//! - Follower closure and outbound delivery
//! - Inbox processing and the remote post cache
//! - Archival, locking and notifications

pub mod archive;
pub mod cache;
pub mod closure;
pub mod delivery;
pub mod envelope;
pub mod fetch;
mod follow;
pub mod ident;
mod inbox;
pub mod keys;
pub mod notify;
pub mod resolver;
pub mod signature;
pub mod webfinger;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

pub use archive::Archiver;
pub use cache::{CacheWrite, RemoteCache};
pub use delivery::{DeliveryBatch, DeliveryEngine, DeliveryOutcome, RetryPolicy, builder};
pub use envelope::{Activity, Collection, Object, accept_activity, decode_activity};
pub use fetch::RemoteFetcher;
pub use inbox::{DropReason, InboxOutcome};
pub use keys::KeyStore;
pub use notify::{LogNotifier, Notifier};
pub use resolver::{ActorResolver, ResolverStats};

use crate::config::AppConfig;
use crate::data::{Actor, FederationStore, ObjectOrigin};
use crate::error::AppError;

/// The federation engine, shared by every handler.
pub struct Federation {
    store: Arc<dyn FederationStore>,
    fetcher: RemoteFetcher,
    resolver: Arc<ActorResolver>,
    keys: Arc<KeyStore>,
    delivery: DeliveryEngine,
    cache: Arc<RemoteCache>,
    archiver: Arc<Archiver>,
    notifier: Arc<dyn Notifier>,
    base_url: String,
    replay_window: Duration,
}

impl Federation {
    /// Wire the engine from configuration.
    ///
    /// # Errors
    /// `AppError::Config` if a blacklist pattern does not compile.
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn FederationStore>,
        client: reqwest::Client,
    ) -> Result<Self, AppError> {
        let fetcher = RemoteFetcher::new(client.clone());
        let resolver = Arc::new(ActorResolver::new(
            store.clone(),
            fetcher.clone(),
            &config.server.protocol,
        ));
        let keys = Arc::new(KeyStore::new(
            store.clone(),
            config.federation.key_directory.clone(),
            config.federation.key_bits,
        ));
        let delivery = DeliveryEngine::new(
            client,
            keys.clone(),
            resolver.clone(),
            RetryPolicy::from_config(&config.federation),
        );
        let cache = Arc::new(RemoteCache::new(
            store.clone(),
            fetcher.clone(),
            resolver.clone(),
            &config.blacklist.patterns,
        )?);
        let archiver = Arc::new(Archiver::new(store.clone(), config.archive.thread_limit));

        Ok(Self {
            store,
            fetcher,
            resolver,
            keys,
            delivery,
            cache,
            archiver,
            notifier: Arc::new(LogNotifier),
            base_url: config.server.base_url(),
            replay_window: config.federation.replay_window(),
        })
    }

    /// Replace the retry schedule, e.g. with a millisecond backoff in tests.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.delivery = DeliveryEngine::new(
            self.fetcher.client().clone(),
            self.keys.clone(),
            self.resolver.clone(),
            policy,
        );
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn FederationStore> {
        &self.store
    }

    pub fn resolver(&self) -> &ActorResolver {
        &self.resolver
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.delivery
    }

    pub fn cache(&self) -> &RemoteCache {
        &self.cache
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Id of the instance-level actor.
    pub fn main_actor_id(&self) -> &str {
        &self.base_url
    }

    /// Widen `activity.to` to followers and followers-of-followers.
    pub async fn expand_recipients(&self, activity: &mut Activity) {
        closure::expand_recipients(&self.fetcher, activity).await;
    }

    /// Create a board: generate its key pair and store the actor.
    pub async fn provision_board(
        &self,
        name: &str,
        title: &str,
        summary: &str,
    ) -> Result<Actor, AppError> {
        if self.store.get_actor_by_id_or_name(name).await?.is_some() {
            return Err(AppError::Validation(format!("board {name} already exists")));
        }

        let mut board = Actor::new_board(&self.base_url, name, title, summary);
        self.keys.provision(&mut board).await?;
        self.store.insert_actor(&board).await?;

        tracing::info!(actor = %board.id, "Provisioned board");
        Ok(board)
    }

    // =========================================================================
    // Local post lifecycle
    // =========================================================================

    /// Store a post written on `local` and federate it.
    ///
    /// The post gets a fresh id under the board. Delivery runs detached; the
    /// returned post is final as soon as it is stored.
    pub async fn publish(&self, local: &Actor, mut post: Object) -> Result<Object, AppError> {
        if !self.resolver.is_local(&local.id).await? {
            return Err(AppError::Validation(format!(
                "{} is not a local actor",
                local.id
            )));
        }

        if let Some(parent) = post.parent_id() {
            if self.store.is_locked(parent).await? {
                return Err(AppError::Validation("thread locked".to_string()));
            }
        }

        let now = Utc::now();
        post.id = ident::unique_post_id(self.store.as_ref(), &local.id).await?;
        post.actor = local.id.clone();
        if post.kind.is_empty() {
            post.kind = "Note".to_string();
        }
        post.published = Some(now);
        post.updated = Some(now);

        if self.cache.write_local(&post).await? == CacheWrite::Blacklisted {
            return Err(AppError::PolicyRejection(
                "post matches the content blacklist".to_string(),
            ));
        }

        if let Err(e) = self.archiver.archive_posts(local).await {
            tracing::warn!(actor = %local.id, error = %e, "Archival rotation failed");
        }

        let create = builder::create(local, post.clone());
        self.delivery.deliver_expanded(local, create, self.fetcher.clone());

        tracing::info!(actor = %local.id, post = %post.id, "Published post");
        Ok(post)
    }

    /// Tombstone a local post (and its replies, for a thread root) and tell
    /// the owning board's followers and followed boards.
    pub async fn delete_post(&self, id: &str) -> Result<DeliveryBatch, AppError> {
        let record = self.store.get_object(id).await?.ok_or(AppError::NotFound)?;
        if record.origin != ObjectOrigin::Local {
            return Err(AppError::Validation(format!("{id} is not a local post")));
        }

        let owner = ident::actor_id_from_object_id(id);
        let local = self
            .store
            .get_actor_by_id_or_name(&owner)
            .await?
            .ok_or(AppError::NotFound)?;

        let now = Utc::now();
        if self.store.is_thread_root(id).await? {
            for reply in self.store.replies_of(id).await? {
                self.store.tombstone(&reply, now).await?;
            }
        }
        self.store.tombstone(id, now).await?;

        let mut to = self.store.get_followers(&local.id).await?;
        for following in self.store.get_following(&local.id).await? {
            if !to.contains(&following) {
                to.push(following);
            }
        }

        let delete = builder::delete(&local, id, to);
        tracing::info!(actor = %local.id, post = %id, "Deleted post");
        self.delivery.deliver(&local, &delete).await
    }

    // =========================================================================
    // Serving stored posts
    // =========================================================================

    async fn load_object(&self, id: &str) -> Result<Option<Object>, AppError> {
        let Some(record) = self.store.get_object(id).await? else {
            return Ok(None);
        };
        let mut object = cache::object_from(&record);

        if !record.attachment.is_empty() {
            if let Some(attachment) = self.store.get_object(&record.attachment).await? {
                object.attachment = vec![cache::object_from(&attachment)];
            }
        }
        if !record.preview.is_empty() {
            if let Some(preview) = self.store.get_object(&record.preview).await? {
                object.preview = Some(Box::new(cache::object_from(&preview)));
            }
        }
        Ok(Some(object))
    }

    /// A stored post as a one-item collection. Thread roots carry their
    /// replies inline.
    pub async fn thread_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        let Some(mut object) = self.load_object(id).await? else {
            return Ok(None);
        };

        if self.store.is_thread_root(id).await? {
            let mut replies = Vec::new();
            for reply_id in self.store.replies_of(id).await? {
                if let Some(mut reply) = self.load_object(&reply_id).await? {
                    reply.in_reply_to = vec![Object {
                        id: id.to_string(),
                        ..Default::default()
                    }];
                    replies.push(reply);
                }
            }
            if !replies.is_empty() {
                object.replies = Some(Box::new(ordered_collection(replies)));
            }
        }

        Ok(Some(ordered_collection(vec![object])))
    }

    /// Live threads authored on `local`, most recently bumped first.
    pub async fn outbox_collection(&self, local: &Actor) -> Result<Collection, AppError> {
        let mut posts = Vec::new();
        for id in self.store.board_threads(&local.id, "Note", 0, None).await? {
            if let Some(post) = self.load_object(&id).await? {
                if post.actor == local.id {
                    posts.push(post);
                }
            }
        }

        let mut outbox = ordered_collection(posts);
        outbox.id = local.outbox.clone();
        outbox.actor = local.id.clone();
        Ok(outbox)
    }

    /// Deliver `activity` to `actor`'s followers as well as its own audience.
    pub async fn send_to_followers(
        &self,
        actor: &Actor,
        mut activity: Activity,
    ) -> Result<DeliveryBatch, AppError> {
        for follower in self.store.get_followers(&actor.id).await? {
            if !activity.to.contains(&follower) {
                activity.to.push(follower);
            }
        }
        self.delivery.deliver(actor, &activity).await
    }
}

fn ordered_collection(items: Vec<Object>) -> Collection {
    Collection {
        context: envelope::ACTIVITY_STREAMS.to_string(),
        kind: "OrderedCollection".to_string(),
        total_items: items.len() as i64,
        ordered_items: items,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::{Database, ObjectRecord};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    pub(crate) async fn federation() -> (Federation, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let mut config = valid_config();
        config.federation.key_directory = temp_dir.path().join("keys");
        config.blacklist.patterns = vec!["forbidden".to_string()];

        let federation = Federation::new(&config, db.clone(), reqwest::Client::new())
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 1,
                backoff_unit: Duration::from_millis(1),
                spacing: Duration::from_millis(1),
            });
        (federation, db, temp_dir)
    }

    /// A remote instance hosting the single board `<base>/b`.
    pub(crate) struct Peer {
        pub(crate) base: String,
        pub(crate) state: Arc<PeerState>,
    }

    #[derive(Default)]
    pub(crate) struct PeerState {
        pub(crate) followers: Mutex<Vec<String>>,
        pub(crate) following: Mutex<Vec<String>>,
        /// Served at their id; also listed in the outbox.
        pub(crate) posts: Mutex<Vec<Object>>,
        pub(crate) received: Mutex<Vec<serde_json::Value>>,
    }

    impl Peer {
        pub(crate) async fn start() -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let state = Arc::new(PeerState::default());

            let app = Router::new()
                .fallback(peer_route)
                .with_state((base.clone(), state.clone()));
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self { base, state }
        }

        pub(crate) fn board(&self) -> String {
            format!("{}/b", self.base)
        }

        pub(crate) fn post_id(&self, suffix: &str) -> String {
            format!("{}/b/{suffix}", self.base)
        }

        pub(crate) fn set_followers(&self, followers: &[&str]) {
            *self.state.followers.lock().unwrap() =
                followers.iter().map(|f| f.to_string()).collect();
        }

        pub(crate) fn set_following(&self, following: &[&str]) {
            *self.state.following.lock().unwrap() =
                following.iter().map(|f| f.to_string()).collect();
        }

        pub(crate) fn host(&self, post: Object) {
            self.state.posts.lock().unwrap().push(post);
        }

        pub(crate) fn received(&self) -> Vec<serde_json::Value> {
            self.state.received.lock().unwrap().clone()
        }
    }

    async fn peer_route(
        State((base, state)): State<(String, Arc<PeerState>)>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> Response {
        let board = format!("{base}/b");
        let path = uri.path();

        if method == Method::POST && path == "/b/inbox" {
            if let Ok(value) = serde_json::from_slice(&body) {
                state.received.lock().unwrap().push(value);
            }
            return StatusCode::OK.into_response();
        }

        let collection = |items: Vec<serde_json::Value>| {
            Json(json!({
                "@context": envelope::ACTIVITY_STREAMS,
                "type": "OrderedCollection",
                "totalItems": items.len(),
                "orderedItems": items,
            }))
            .into_response()
        };

        match path {
            "/b" => Json(json!({
                "@context": envelope::ACTIVITY_STREAMS,
                "type": "Group",
                "id": board,
                "preferredUsername": "b",
                "inbox": format!("{board}/inbox"),
                "outbox": format!("{board}/outbox"),
                "followers": format!("{board}/followers"),
                "following": format!("{board}/following"),
            }))
            .into_response(),
            "/b/followers" => {
                let followers = state.followers.lock().unwrap().clone();
                collection(followers.into_iter().map(|id| json!({ "id": id })).collect())
            }
            "/b/following" => {
                let following = state.following.lock().unwrap().clone();
                collection(following.into_iter().map(|id| json!({ "id": id })).collect())
            }
            "/b/outbox" => {
                let posts = state.posts.lock().unwrap().clone();
                collection(posts.iter().map(|p| serde_json::to_value(p).unwrap()).collect())
            }
            _ => {
                let id = format!("{base}{path}");
                let post = state
                    .posts
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|p| p.id == id)
                    .cloned();
                match post {
                    Some(post) => collection(vec![serde_json::to_value(post).unwrap()]),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
        }
    }

    #[tokio::test]
    async fn provision_board_stores_actor_and_key() {
        let (federation, db, _temp_dir) = federation().await;

        let board = federation.provision_board("g", "Technology", "").await.unwrap();
        assert_eq!(board.id, "http://localhost:8080/g");

        let stored = db.get_actor_by_id_or_name("g").await.unwrap().unwrap();
        assert!(!stored.public_key.unwrap().public_key_pem.is_empty());
        assert!(federation.keys().private_key_for(&board).await.is_ok());

        assert!(matches!(
            federation.provision_board("g", "Again", "").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn publish_assigns_id_and_stores_locally() {
        let (federation, db, _temp_dir) = federation().await;
        let board = federation.provision_board("g", "Technology", "").await.unwrap();

        let post = federation
            .publish(
                &board,
                Object {
                    content: "first".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(post.id.starts_with("http://localhost:8080/g/"));
        assert_eq!(post.id.len(), "http://localhost:8080/g/".len() + ident::POST_ID_LEN);

        let stored = db.get_object(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.origin, ObjectOrigin::Local);
        assert!(db.is_thread_root(&post.id).await.unwrap());
    }

    #[tokio::test]
    async fn publish_does_not_wait_on_follower_collections() {
        let (federation, _db, _temp_dir) = federation().await;
        let board = federation.provision_board("g", "Technology", "").await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled = format!("http://{}/b", listener.local_addr().unwrap());
        let app = Router::new().route(
            "/b/followers",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                StatusCode::OK
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let post = Object {
            content: "hello".to_string(),
            to: vec![stalled],
            ..Default::default()
        };
        let published =
            tokio::time::timeout(Duration::from_secs(2), federation.publish(&board, post)).await;

        assert!(published.is_ok(), "publish waited on a stalled peer");
        assert!(published.unwrap().is_ok());
    }

    #[tokio::test]
    async fn publish_refuses_blacklisted_and_locked() {
        let (federation, db, _temp_dir) = federation().await;
        let board = federation.provision_board("g", "Technology", "").await.unwrap();

        let spam = federation
            .publish(
                &board,
                Object {
                    content: "forbidden words".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(spam, Err(AppError::PolicyRejection(_))));

        let root = federation
            .publish(&board, Object::default())
            .await
            .unwrap();
        db.toggle_locked(&board.id, &root.id).await.unwrap();

        let reply = federation
            .publish(
                &board,
                Object {
                    in_reply_to: vec![Object {
                        id: root.id.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(reply, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn stored_threads_are_served_with_replies() {
        let (federation, _db, _temp_dir) = federation().await;
        let board = federation.provision_board("g", "Technology", "").await.unwrap();

        let root = federation
            .publish(
                &board,
                Object {
                    content: "<b>root</b>".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let reply = federation
            .publish(
                &board,
                Object {
                    in_reply_to: vec![Object {
                        id: root.id.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let thread = federation.thread_collection(&root.id).await.unwrap().unwrap();
        assert_eq!(thread.members().len(), 1);
        let served = &thread.members()[0];
        assert_eq!(served.content, "&lt;b&gt;root&lt;/b&gt;");
        let replies = served.replies.as_deref().unwrap();
        assert_eq!(replies.member_ids(), vec![reply.id.clone()]);
        assert_eq!(replies.members()[0].parent_id(), Some(root.id.as_str()));

        let outbox = federation.outbox_collection(&board).await.unwrap();
        assert_eq!(outbox.member_ids(), vec![root.id.clone()]);

        assert!(
            federation
                .thread_collection("http://localhost:8080/g/MISSING0")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_post_tombstones_thread() {
        let (federation, db, _temp_dir) = federation().await;
        let board = federation.provision_board("g", "Technology", "").await.unwrap();

        let root = federation.publish(&board, Object::default()).await.unwrap();
        let reply = federation
            .publish(
                &board,
                Object {
                    in_reply_to: vec![Object {
                        id: root.id.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        federation.delete_post(&root.id).await.unwrap();

        for id in [&root.id, &reply.id] {
            let stored = db.get_object(id).await.unwrap().unwrap();
            assert_eq!(stored.kind, "Tombstone");
        }

        let cached = ObjectRecord::new("https://a.example/b/CACHED01", "Note", ObjectOrigin::Cache);
        db.insert_if_absent(&cached).await.unwrap();
        assert!(matches!(
            federation.delete_post(&cached.id).await,
            Err(AppError::Validation(_))
        ));
    }
}
