//! ActivityPub endpoints
//!
//! - Actor documents
//! - Inbox (signed inbound activities)
//! - Outbox (the board's own signed Follow, relayed to the target)
//! - Followers/Following collections
//!
//! Every route exists twice: at the root for the main actor and under
//! `/:board` for boards.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::data::{Actor, FederationStore};
use crate::error::AppError;
use crate::federation::envelope::{ACTIVITY_CONTENT_TYPE, ACTIVITY_STREAMS};
use crate::federation::{Activity, accept_activity, decode_activity};
use crate::metrics::HTTP_REQUEST_DURATION_SECONDS;

const MAIN_ACTOR: &str = "main";

/// Create ActivityPub router
///
/// Routes:
/// - GET / and /:board - Actor document
/// - POST /inbox and /:board/inbox - Inbox
/// - POST /outbox and /:board/outbox - Outbox
/// - GET /outbox and /:board/outbox - Live threads
/// - GET /followers, /following and their /:board variants - Collections
/// - GET /:board/:post - A stored post as a collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/", get(actor))
        .route("/:board", get(actor))
        .route("/inbox", post(inbox))
        .route("/:board/inbox", post(inbox))
        .route("/outbox", get(outbox_collection).post(outbox))
        .route("/:board/outbox", get(outbox_collection).post(outbox))
        .route("/followers", get(followers))
        .route("/:board/followers", get(followers))
        .route("/following", get(following))
        .route("/:board/following", get(following))
        .route("/:board/:post", get(post_collection))
}

async fn load_board(state: &AppState, board: Option<Path<String>>) -> Result<Actor, AppError> {
    let name = board.map_or_else(|| MAIN_ACTOR.to_string(), |Path(name)| name);
    state
        .db
        .get_actor_by_id_or_name(&name)
        .await?
        .ok_or(AppError::NotFound)
}

fn activity_json(value: serde_json::Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        Json(value),
    )
        .into_response()
}

/// GET /:board
async fn actor(
    State(state): State<AppState>,
    board: Option<Path<String>>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/:board"])
        .start_timer();

    let actor = load_board(&state, board).await?;
    Ok(activity_json(actor.to_document()))
}

/// Decode a signed activity and replace its actor with the verified signer.
async fn authenticated_activity(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Activity, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !accept_activity(content_type) {
        return Err(AppError::Validation(format!(
            "unsupported content type {content_type:?}"
        )));
    }

    let mut activity = decode_activity(body)?;
    if activity.actor.id.is_empty() {
        return Err(AppError::Validation("activity has no actor".to_string()));
    }

    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |p| p.as_str());
    activity.actor = state
        .federation
        .authenticate("POST", path, headers, body, &activity.actor.id)
        .await?;
    Ok(activity)
}

/// POST /:board/inbox
///
/// # Steps
/// 1. Load the addressed board
/// 2. Decode the envelope and verify the sender's signature
/// 3. Run the activity through the inbox state machine
async fn inbox(
    State(state): State<AppState>,
    board: Option<Path<String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/:board/inbox"])
        .start_timer();

    let local = load_board(&state, board).await?;
    let activity = authenticated_activity(&state, &uri, &headers, &body).await?;

    let kind = activity.kind.clone();
    let remote = activity.actor.id.clone();
    let outcome = state.federation.process_activity(&local, activity).await?;

    tracing::debug!(
        actor = %local.id,
        remote = %remote,
        activity_type = %kind,
        ?outcome,
        "Inbox activity processed"
    );
    Ok(StatusCode::OK)
}

/// POST /:board/outbox
///
/// Accepts the board's own signed Follow and relays it to the target inbox.
async fn outbox(
    State(state): State<AppState>,
    board: Option<Path<String>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/:board/outbox"])
        .start_timer();

    let local = load_board(&state, board).await?;
    let activity = authenticated_activity(&state, &uri, &headers, &body).await?;

    if activity.actor.id != local.id {
        tracing::debug!(actor = %local.id, signer = %activity.actor.id, "Outbox post from another actor");
        return Err(AppError::Authentication);
    }
    if activity.kind != "Follow" {
        return Err(AppError::Validation(format!(
            "outbox does not accept {}",
            activity.kind
        )));
    }

    let batch = state.federation.delivery().deliver(&local, &activity).await?;
    tracing::info!(actor = %local.id, targets = ?batch.targets, "Relayed follow");
    Ok(StatusCode::OK)
}

/// GET /:board/outbox
async fn outbox_collection(
    State(state): State<AppState>,
    board: Option<Path<String>>,
) -> Result<Response, AppError> {
    let actor = load_board(&state, board).await?;
    let outbox = state.federation.outbox_collection(&actor).await?;
    Ok(activity_json(serde_json::to_value(outbox).unwrap_or_default()))
}

/// GET /:board/:post
async fn post_collection(
    State(state): State<AppState>,
    Path((board, post)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/:board/:post"])
        .start_timer();

    let actor = load_board(&state, Some(Path(board))).await?;
    let id = format!("{}/{post}", actor.id);
    let thread = state
        .federation
        .thread_collection(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(activity_json(serde_json::to_value(thread).unwrap_or_default()))
}

fn collection(ids: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "@context": ACTIVITY_STREAMS,
        "type": "Collection",
        "totalItems": ids.len(),
        "items": ids
            .into_iter()
            .map(|id| serde_json::json!({ "id": id }))
            .collect::<Vec<_>>(),
    })
}

/// GET /:board/followers
async fn followers(
    State(state): State<AppState>,
    board: Option<Path<String>>,
) -> Result<Response, AppError> {
    let actor = load_board(&state, board).await?;
    let ids = state.db.get_followers(&actor.id).await?;
    Ok(activity_json(collection(ids)))
}

/// GET /:board/following
async fn following(
    State(state): State<AppState>,
    board: Option<Path<String>>,
) -> Result<Response, AppError> {
    let actor = load_board(&state, board).await?;
    let ids = state.db.get_following(&actor.id).await?;
    Ok(activity_json(collection(ids)))
}
