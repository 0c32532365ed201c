//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::data::FederationStore;
use crate::error::AppError;
use crate::federation::webfinger::{generate_webfinger_response, local_account_name};

pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:board@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let domain = &state.config.server.domain;
    let name = local_account_name(&query.resource, domain).ok_or(AppError::NotFound)?;

    let actor = state
        .db
        .get_actor_by_id_or_name(name)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(generate_webfinger_response(&actor, domain)),
    )
        .into_response())
}
