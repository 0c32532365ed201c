//! Admin API endpoints
//!
//! Operator endpoints for board provisioning and moderation.
//! All routes require `Authorization: Bearer <admin.token>`.

use axum::{
    Router,
    async_trait,
    extract::{FromRef, FromRequestParts, State},
    http::request::Parts,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{Actor, BoardOptions, FederationStore};
use crate::error::AppError;
use crate::federation::Object;

/// Create admin router
///
/// Routes:
/// - POST /admin/boards - Provision a board and its key pair
/// - POST /admin/posts - Publish a local post
/// - POST /admin/follow - Follow a board
/// - POST /admin/options - Set option mask / auto-subscribe
/// - POST /admin/lock - Toggle a thread lock
/// - POST /admin/unarchive - Restore the last archived thread
/// - POST /admin/delete - Delete a local post
/// - GET /admin/resolver - Actor cache stats
/// - POST /admin/resolver/clear - Drop cached actors
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/boards", post(create_board))
        .route("/posts", post(publish))
        .route("/follow", post(follow))
        .route("/options", post(set_options))
        .route("/lock", post(toggle_lock))
        .route("/unarchive", post(unarchive))
        .route("/delete", post(delete_post))
        .route("/resolver", get(resolver_stats))
        .route("/resolver/clear", post(clear_resolver))
}

/// Operator authenticated by the configured bearer token.
#[derive(Debug, Clone, Copy)]
pub struct Operator;

#[async_trait]
impl<S> FromRequestParts<S> for Operator
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        if token != state.config.admin.token {
            return Err(AppError::Unauthorized);
        }
        Ok(Operator)
    }
}

async fn local_board(state: &AppState, key: &str) -> Result<Actor, AppError> {
    state
        .db
        .get_actor_by_id_or_name(key)
        .await?
        .ok_or(AppError::NotFound)
}

// =============================================================================
// Boards
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateBoardRequest {
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    options: i64,
    #[serde(default)]
    auto_subscribe: bool,
}

/// POST /admin/boards
async fn create_board(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<CreateBoardRequest>,
) -> Result<Json<Value>, AppError> {
    if req.name.is_empty() || !req.name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation(
            "board name must be alphanumeric".to_string(),
        ));
    }

    let mut board = state
        .federation
        .provision_board(&req.name, &req.title, &req.summary)
        .await?;

    if req.options != 0 {
        board.options_mask = BoardOptions(req.options);
        state.db.set_options(&board.id, board.options_mask).await?;
    }
    if req.auto_subscribe {
        state.db.set_auto_subscribe(&board.id, true).await?;
    }

    Ok(Json(board.to_document()))
}

#[derive(Debug, Deserialize)]
struct OptionsRequest {
    actor: String,
    options: i64,
    auto_subscribe: Option<bool>,
}

/// POST /admin/options
async fn set_options(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<OptionsRequest>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &req.actor).await?;

    state.db.set_options(&board.id, BoardOptions(req.options)).await?;
    if let Some(enabled) = req.auto_subscribe {
        state.db.set_auto_subscribe(&board.id, enabled).await?;
    }

    tracing::info!(actor = %board.id, options = req.options, "Board options updated");
    Ok(Json(json!({ "actor": board.id, "options": req.options })))
}

// =============================================================================
// Posts and threads
// =============================================================================

#[derive(Debug, Deserialize)]
struct PublishRequest {
    actor: String,
    post: Object,
}

/// POST /admin/posts
async fn publish(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<PublishRequest>,
) -> Result<Json<Object>, AppError> {
    let board = local_board(&state, &req.actor).await?;
    let post = state.federation.publish(&board, req.post).await?;
    Ok(Json(post))
}

#[derive(Debug, Deserialize)]
struct ThreadRequest {
    actor: String,
    id: String,
}

/// POST /admin/lock
async fn toggle_lock(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<ThreadRequest>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &req.actor).await?;
    let locked = state
        .federation
        .archiver()
        .toggle_locked(&board.id, &req.id)
        .await?;

    tracing::info!(actor = %board.id, thread = %req.id, locked, "Thread lock toggled");
    Ok(Json(json!({ "id": req.id, "locked": locked })))
}

#[derive(Debug, Deserialize)]
struct ActorRequest {
    actor: String,
}

/// POST /admin/unarchive
async fn unarchive(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<ActorRequest>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &req.actor).await?;
    let thread = state.federation.archiver().unarchive_last(&board).await?;
    Ok(Json(json!({ "thread": thread })))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    id: String,
}

/// POST /admin/delete
async fn delete_post(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<Value>, AppError> {
    let batch = state.federation.delete_post(&req.id).await?;
    Ok(Json(json!({ "id": req.id, "targets": batch.targets })))
}

// =============================================================================
// Federation
// =============================================================================

#[derive(Debug, Deserialize)]
struct FollowRequest {
    actor: String,
    /// Actor URL or `name@host` handle
    target: String,
}

/// POST /admin/follow
async fn follow(
    State(state): State<AppState>,
    _operator: Operator,
    Json(req): Json<FollowRequest>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &req.actor).await?;
    let batch = state.federation.follow(&board, &req.target).await?;
    Ok(Json(json!({ "actor": board.id, "targets": batch.targets })))
}

/// GET /admin/resolver
async fn resolver_stats(
    State(state): State<AppState>,
    _operator: Operator,
) -> Json<Value> {
    let stats = state.federation.resolver().stats().await;
    Json(json!({
        "entries": stats.entries,
        "hits": stats.hits,
        "misses": stats.misses,
    }))
}

/// POST /admin/resolver/clear
async fn clear_resolver(
    State(state): State<AppState>,
    _operator: Operator,
) -> Json<Value> {
    state.federation.resolver().clear().await;
    Json(json!({ "cleared": true }))
}
