//! Actor resolution
//!
//! Lookup order: the store (authoritative for local actors), then the
//! in-process cache, then the peer itself. The cache has no expiry. A
//! successful remote fetch overwrites the entry, a failed one leaves it
//! untouched. Concurrent resolutions of the same id are not coordinated;
//! the last write wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::fetch::RemoteFetcher;
use super::webfinger::resolve_webfinger;
use crate::data::{Actor, FederationStore};
use crate::error::AppError;
use crate::metrics::ACTOR_RESOLUTIONS_TOTAL;

pub struct ActorResolver {
    store: Arc<dyn FederationStore>,
    fetcher: RemoteFetcher,
    /// Scheme used to reach hosts named in `name@host` handles
    scheme: String,
    cache: RwLock<HashMap<String, Actor>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ActorResolver {
    pub fn new(store: Arc<dyn FederationStore>, fetcher: RemoteFetcher, scheme: &str) -> Self {
        Self {
            store,
            fetcher,
            scheme: scheme.to_string(),
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve an actor URL, local name, or `name@host` handle.
    pub async fn resolve(&self, reference: &str) -> Result<Actor, AppError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(AppError::Validation("empty actor reference".to_string()));
        }

        if let Some(actor) = self.known(reference).await? {
            return Ok(actor);
        }

        let url = if is_handle(reference) {
            let url = resolve_webfinger(reference, &self.scheme, self.fetcher.client()).await?;
            if let Some(actor) = self.known(&url).await? {
                return Ok(actor);
            }
            url
        } else {
            reference.to_string()
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.fetcher.get_actor(&url).await {
            Ok(Some(actor)) => {
                if let Err(e) = check_self_describing(&url, &actor) {
                    ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
                    return Err(e);
                }
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["remote"]).inc();
                self.cache.write().await.insert(url.clone(), actor.clone());
                tracing::debug!(actor = %actor.id, "Resolved remote actor");
                Ok(actor)
            }
            Ok(None) => {
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
                Err(AppError::NotFound)
            }
            Err(e) => {
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    /// Store or cache lookup only. Never touches the network.
    pub async fn known(&self, id: &str) -> Result<Option<Actor>, AppError> {
        if let Some(actor) = self.store.get_actor_by_id_or_name(id).await? {
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["store"]).inc();
            return Ok(Some(actor));
        }

        let cached = self.cache.read().await.get(id).cloned();
        if cached.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cache"]).inc();
        }
        Ok(cached)
    }

    /// Whether the actor is hosted by this instance.
    pub async fn is_local(&self, id: &str) -> Result<bool, AppError> {
        Ok(self.store.get_actor_by_id_or_name(id).await?.is_some())
    }

    /// Drop one cached actor, e.g. after its key changed.
    pub async fn invalidate(&self, id: &str) {
        self.cache.write().await.remove(id);
        tracing::debug!(actor = %id, "Invalidated cached actor");
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
        tracing::debug!("Cleared actor cache");
    }

    pub async fn stats(&self) -> ResolverStats {
        ResolverStats {
            entries: self.cache.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// A fetched actor document must name the URL it was fetched from, and its
/// key must belong to that actor.
fn check_self_describing(url: &str, actor: &Actor) -> Result<(), AppError> {
    if actor.id != url {
        tracing::warn!(url = %url, declared = %actor.id, "Actor document declares a foreign id");
        return Err(AppError::Validation(format!(
            "actor document at {url} declares id {}",
            actor.id
        )));
    }
    if let Some(key) = &actor.public_key {
        if key.owner != actor.id {
            tracing::warn!(actor = %actor.id, owner = %key.owner, "Actor key owned by someone else");
            return Err(AppError::Validation(format!(
                "key {} is not owned by {}",
                key.id, actor.id
            )));
        }
    }
    Ok(())
}

fn is_handle(reference: &str) -> bool {
    !reference.starts_with("http://") && !reference.starts_with("https://") && reference.contains('@')
}

/// Actor cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverStats {
    /// Cached remote actors
    pub entries: usize,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that went to the network
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use axum::{Json, Router, extract::State, routing::get};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    async fn resolver() -> (ActorResolver, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let resolver =
            ActorResolver::new(db.clone(), RemoteFetcher::new(reqwest::Client::new()), "http");
        (resolver, db, temp_dir)
    }

    async fn actor_server(fetches: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let id = format!("{base}/b");

        let app = Router::new()
            .route(
                "/b",
                get(|State((fetches, id)): State<(Arc<AtomicUsize>, String)>| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "@context": "https://www.w3.org/ns/activitystreams",
                        "type": "Group",
                        "id": id,
                        "inbox": format!("{id}/inbox"),
                        "preferredUsername": "b"
                    }))
                }),
            )
            .with_state((fetches, id));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn local_actors_come_from_the_store() {
        let (resolver, db, _temp_dir) = resolver().await;
        let board = Actor::new_board("https://chan.example", "g", "Technology", "");
        db.insert_actor(&board).await.unwrap();

        let resolved = resolver.resolve("https://chan.example/g").await.unwrap();
        assert_eq!(resolved.id, board.id);
        assert!(resolver.is_local(&board.id).await.unwrap());
        assert!(!resolver.is_local("https://a.example/b").await.unwrap());
        assert_eq!(resolver.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn remote_actor_is_cached_after_first_fetch() {
        let (resolver, _db, _temp_dir) = resolver().await;
        let fetches = Arc::new(AtomicUsize::new(0));
        let base = actor_server(fetches.clone()).await;
        let id = format!("{base}/b");

        let first = resolver.resolve(&id).await.unwrap();
        let second = resolver.resolve(&id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.inbox, format!("{id}/inbox"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            resolver.stats().await,
            ResolverStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );

        resolver.invalidate(&id).await;
        resolver.resolve(&id).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    async fn lying_server(key_owner: Option<&'static str>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let app = Router::new()
            .route(
                "/x",
                get(move |State(base): State<String>| async move {
                    let id = format!("{base}/x");
                    let (declared, owner) = match key_owner {
                        Some(owner) => (id.clone(), owner.to_string()),
                        None => ("https://victim.example/b".to_string(), id.clone()),
                    };
                    Json(json!({
                        "@context": "https://www.w3.org/ns/activitystreams",
                        "type": "Group",
                        "id": declared,
                        "inbox": format!("{id}/inbox"),
                        "publicKey": {
                            "id": format!("{id}#main-key"),
                            "owner": owner,
                            "publicKeyPem": "-----BEGIN PUBLIC KEY-----"
                        }
                    }))
                }),
            )
            .with_state(base.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn document_claiming_another_id_is_refused() {
        let (resolver, _db, _temp_dir) = resolver().await;
        let base = lying_server(None).await;

        let result = resolver.resolve(&format!("{base}/x")).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(resolver.known("https://victim.example/b").await.unwrap().is_none());
        assert_eq!(resolver.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn key_owned_by_another_actor_is_refused() {
        let (resolver, _db, _temp_dir) = resolver().await;
        let base = lying_server(Some("https://victim.example/b")).await;

        let result = resolver.resolve(&format!("{base}/x")).await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(resolver.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn failed_resolution_is_not_cached() {
        let (resolver, _db, _temp_dir) = resolver().await;

        assert!(resolver.resolve("http://127.0.0.1:1/b").await.is_err());
        assert!(resolver.known("http://127.0.0.1:1/b").await.unwrap().is_none());
        assert_eq!(resolver.stats().await.entries, 0);

        resolver.clear().await;
        assert_eq!(resolver.stats().await.entries, 0);
    }
}
