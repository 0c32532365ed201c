//! Identifier helpers
//!
//! Post ids are `<actor>/<8 chars of [0-9A-Z]>`, so the owning actor of
//! any object can be recovered from its id alone.

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

use crate::data::FederationStore;
use crate::error::AppError;

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of the random suffix on post ids.
pub const POST_ID_LEN: usize = 8;

const MAX_ID_ATTEMPTS: usize = 10;

lazy_static! {
    static ref HANDLE_FORM: Regex =
        Regex::new(r"^@?([\w.-]+)@(.+)$").expect("handle regex is valid");
    static ref MAIN_FORM: Regex =
        Regex::new(r"^https?://(?:www\.)?([\w.:-]+)/?$").expect("main actor regex is valid");
    static ref URL_FORM: Regex =
        Regex::new(r"^(?:https?://)?(?:www\.)?([\w.:-]+)/([\w.-]+)(?:/([\w.-]+))?")
            .expect("actor url regex is valid");
}

/// Random string of `size` characters from `[0-9A-Z]`.
pub fn random_id(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Allocate a post id under `actor_id` that is not yet taken.
pub async fn unique_post_id(
    store: &dyn FederationStore,
    actor_id: &str,
) -> Result<String, AppError> {
    let base = actor_id.trim_end_matches('/');

    for attempt in 1..=MAX_ID_ATTEMPTS {
        let candidate = format!("{base}/{}", random_id(POST_ID_LEN));
        if !store.object_exists(&candidate).await? {
            return Ok(candidate);
        }
        tracing::warn!(id = %candidate, attempt, "Post id collision");
    }

    Err(AppError::Internal(anyhow::anyhow!(
        "failed to generate a unique post id for {actor_id}"
    )))
}

/// `scheme://host/first-segment` of an object id, or empty if there is no path.
pub fn actor_id_from_object_id(object_id: &str) -> String {
    let Some((scheme, rest)) = object_id.split_once("://") else {
        return String::new();
    };
    let Some((host, path)) = rest.split_once('/') else {
        return String::new();
    };
    let board = path.split('/').next().unwrap_or_default();

    format!("{scheme}://{host}/{board}")
}

/// Whether an actor id is an instance root (no path component).
pub fn is_main_actor_id(actor_id: &str) -> bool {
    MAIN_FORM.is_match(actor_id)
}

/// Split an actor reference into `(name, instance)`.
///
/// Accepts `name@host`, `@name@host`, `https://host` (the main actor) and
/// `https://host/name`. Returns empty strings when nothing matches.
pub fn actor_and_instance(reference: &str) -> (String, String) {
    let reference = reference.trim();

    if let Some(caps) = HANDLE_FORM.captures(reference) {
        return (caps[1].to_string(), caps[2].to_string());
    }

    if let Some(caps) = MAIN_FORM.captures(reference) {
        return ("main".to_string(), caps[1].to_string());
    }

    if let Some(caps) = URL_FORM.captures(reference) {
        let instance = caps[1].to_string();
        if &caps[2] == "users" {
            let name = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            return (name.to_string(), instance);
        }
        return (caps[2].to_string(), instance);
    }

    (String::new(), String::new())
}
