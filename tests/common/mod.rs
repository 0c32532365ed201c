//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use chanfed::data::Actor;
use chanfed::federation::RetryPolicy;
use chanfed::{AppState, config};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    ///
    /// The listener is bound first so the public domain (and every actor id)
    /// points back at this server.
    pub async fn new() -> Self {
        chanfed::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = listener.local_addr().unwrap().to_string();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: domain.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("test.db"),
            },
            federation: config::FederationConfig {
                max_attempts: 3,
                backoff_unit_secs: 1,
                spacing_ms: 1,
                replay_window_secs: 75,
                request_timeout_secs: 10,
                key_bits: 1024,
                key_directory: temp_dir.path().join("keys"),
                user_agent: "chanfed-test".to_string(),
            },
            blacklist: config::BlacklistConfig::default(),
            archive: config::ArchiveConfig { thread_limit: 165 },
            admin: config::AdminConfig {
                token: ADMIN_TOKEN.to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(10),
            spacing: Duration::from_millis(1),
        };
        let state = AppState::with_retry_policy(config, policy).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = chanfed::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{domain}"),
            domain,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST to an admin route with the operator token
    pub async fn admin(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/admin{path}")))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Provision a board through the admin API
    pub async fn create_board(&self, name: &str) -> Actor {
        let response = self
            .admin(
                "/boards",
                serde_json::json!({ "name": name, "title": format!("/{name}/") }),
            )
            .await;
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    /// Publish a post on a local board through the admin API
    pub async fn publish(&self, board: &str, post: Value) -> Value {
        let response = self
            .admin("/posts", serde_json::json!({ "actor": board, "post": post }))
            .await;
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Make `follower` (on `a`) follow `followed` (on `b`) and wait for the Accept.
pub async fn follow(a: &TestServer, follower: &Actor, followed: &Actor) {
    use chanfed::data::FederationStore;

    let response = a
        .admin(
            "/follow",
            serde_json::json!({ "actor": follower.preferred_username, "target": followed.id }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let db = a.state.db.clone();
    let (follower_id, followed_id) = (follower.id.clone(), followed.id.clone());
    assert!(
        eventually(|| {
            let db = db.clone();
            let (follower_id, followed_id) = (follower_id.clone(), followed_id.clone());
            async move { db.is_following(&follower_id, &followed_id).await.unwrap() }
        })
        .await,
        "follow was never accepted"
    );
}
