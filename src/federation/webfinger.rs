//! WebFinger protocol implementation
//!
//! Used to turn `name@host` handles into actor URLs, and to describe local
//! actors to peers doing the same.

use serde::{Deserialize, Serialize};

use super::envelope::{ACTIVITY_CONTENT_TYPE, accept_activity};
use super::ident::actor_and_instance;
use crate::data::Actor;
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// `href` of the `self` link carrying an activity media type.
    pub fn actor_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self" && link.link_type.as_deref().is_some_and(accept_activity)
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Resolve a `name@host` handle to an actor URL
///
/// # Arguments
/// * `handle` - Account address (`name@host` or `@name@host`)
/// * `scheme` - `http` or `https`, used to reach the remote host
/// * `http_client` - HTTP client
///
/// # Errors
/// `Validation` for an unparseable handle, `NotFound` if the host does not
/// know the account or advertises no ActivityPub actor for it.
pub async fn resolve_webfinger(
    handle: &str,
    scheme: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let (name, host) = actor_and_instance(handle);
    if name.is_empty() || host.is_empty() {
        return Err(AppError::Validation(format!("not an actor handle: {handle}")));
    }

    let resource = format!("acct:{name}@{host}");
    let url = format!(
        "{scheme}://{host}/.well-known/webfinger?resource={}",
        urlencoding::encode(&resource)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json")
        .send()
        .await
        .map_err(|e| AppError::TransientNetwork(format!("WebFinger {resource}: {e}")))?;

    if !response.status().is_success() {
        tracing::debug!(%resource, status = %response.status(), "WebFinger lookup failed");
        return Err(AppError::NotFound);
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::TransientNetwork(format!("WebFinger {resource}: {e}")))?;

    jrd.actor_url().map(str::to_string).ok_or(AppError::NotFound)
}

/// Generate WebFinger response for a local actor.
///
/// # Arguments
/// * `actor` - Local actor
/// * `domain` - Instance domain, as it appears in handles
pub fn generate_webfinger_response(actor: &Actor, domain: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", actor.preferred_username, domain),
        aliases: vec![actor.id.clone()],
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_CONTENT_TYPE.to_string()),
            href: Some(actor.id.clone()),
        }],
    }
}

/// Account name from an `acct:name@domain` resource, if it belongs to `domain`.
pub fn local_account_name<'a>(resource: &'a str, domain: &str) -> Option<&'a str> {
    let account = resource.strip_prefix("acct:").unwrap_or(resource);
    let (name, host) = account.trim_start_matches('@').split_once('@')?;
    (host.eq_ignore_ascii_case(domain) && !name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_response_points_at_actor() {
        let board = Actor::new_board("https://chan.example", "g", "Technology", "");
        let response = generate_webfinger_response(&board, "chan.example");

        assert_eq!(response.subject, "acct:g@chan.example");
        assert_eq!(response.actor_url(), Some("https://chan.example/g"));
    }

    #[test]
    fn actor_url_ignores_html_profile_links() {
        let response: WebFingerResponse = serde_json::from_str(
            r#"{
                "subject": "acct:alice@social.example",
                "links": [
                    {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://social.example/@alice"},
                    {"rel": "self", "type": "application/activity+json", "href": "https://social.example/users/alice"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(response.actor_url(), Some("https://social.example/users/alice"));
    }

    #[test]
    fn resource_must_name_this_domain() {
        assert_eq!(local_account_name("acct:g@chan.example", "chan.example"), Some("g"));
        assert_eq!(local_account_name("g@CHAN.example", "chan.example"), Some("g"));
        assert_eq!(local_account_name("acct:g@other.example", "chan.example"), None);
        assert_eq!(local_account_name("acct:chan.example", "chan.example"), None);
    }
}
