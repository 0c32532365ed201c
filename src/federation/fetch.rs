//! Remote document fetching
//!
//! All GETs against peers go through `RemoteFetcher` so they share one
//! client, one Accept header and one interpretation of failures: a network
//! error is `TransientNetwork`, a non-200 answer is "nothing there".

use serde_json::Value;

use super::envelope::{Collection, LD_ACCEPT, Object};
use crate::data::Actor;
use crate::error::AppError;

#[derive(Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
}

impl RemoteFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET a JSON document. `None` for any status other than 200 or an empty body.
    async fn get_document(&self, url: &str) -> Result<Option<Value>, AppError> {
        let response = self
            .client
            .get(url)
            .header("Accept", LD_ACCEPT)
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(format!("GET {url}: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!(url, status = %response.status(), "Remote document unavailable");
            return Ok(None);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::TransientNetwork(format!("GET {url}: {e}")))?;
        if body.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| AppError::TransientNetwork(format!("GET {url}: malformed JSON: {e}")))
    }

    /// Fetch a collection: a thread, an outbox, or a follower list.
    ///
    /// Some peers answer a post URL with the bare post; that is wrapped into a
    /// one-item collection.
    pub async fn get_collection(&self, url: &str) -> Result<Collection, AppError> {
        let Some(document) = self.get_document(url).await? else {
            return Ok(Collection::default());
        };

        if !document.is_object() {
            return Err(AppError::TransientNetwork(format!(
                "GET {url}: expected a JSON object"
            )));
        }

        let mut collection: Collection =
            serde_json::from_value(document.clone()).unwrap_or_default();

        if collection.kind == "Note" && collection.members().is_empty() {
            let note: Object = serde_json::from_value(document).unwrap_or_default();
            if !note.kind.is_empty() {
                collection.kind = "Collection".to_string();
                collection.ordered_items = vec![note];
                collection.total_items = 1;
            }
        }

        Ok(collection)
    }

    /// Fetch an actor document. `None` if the peer has no such actor.
    pub async fn get_actor(&self, url: &str) -> Result<Option<Actor>, AppError> {
        let Some(document) = self.get_document(url).await? else {
            return Ok(None);
        };

        let actor: Actor = serde_json::from_value(document).unwrap_or_default();
        Ok((!actor.id.is_empty()).then_some(actor))
    }
}
