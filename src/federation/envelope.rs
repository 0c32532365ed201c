//! ActivityPub envelope decoding
//!
//! Peers are loose about shapes: `actor`, `object`, `to`, `cc`, `inReplyTo`
//! and collection items can each be a bare URL, an embedded object, or an
//! array of either. `Node` captures that once at decode time; everything
//! downstream works with plain typed structs. Shapes we do not understand
//! decode to zero values. Only malformed JSON is an error.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::data::Actor;
use crate::error::AppError;

/// ActivityStreams namespace, also the expected `@context`.
pub const ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";

/// Content type used on outbound activity POSTs.
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Accept header for fetching remote documents.
pub const LD_ACCEPT: &str =
    r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;

lazy_static! {
    static ref ACTIVITY_MEDIA_TYPE: Regex =
        Regex::new(r"application/(ld|json|activity)((\+(ld|json))|$)")
            .expect("activity media type regex is valid");
}

// =============================================================================
// Polymorphic fields
// =============================================================================

/// A field that may be a link, an embedded object, or a list of either.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Node<T> {
    Link(String),
    Many(Vec<Node<T>>),
    Object(T),
    Unknown(Value),
}

/// Types that can stand in for a bare link.
pub trait Linkable: Default {
    fn from_link(id: String) -> Self;
    fn link_id(&self) -> &str;
}

impl Linkable for Object {
    fn from_link(id: String) -> Self {
        Object {
            id,
            ..Default::default()
        }
    }

    fn link_id(&self) -> &str {
        &self.id
    }
}

impl Linkable for Actor {
    fn from_link(id: String) -> Self {
        Actor {
            id,
            ..Default::default()
        }
    }

    fn link_id(&self) -> &str {
        &self.id
    }
}

impl<T: Linkable + DeserializeOwned> Node<T> {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or(Node::Unknown(Value::Null))
    }

    /// All entries, links promoted to id-only objects.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Node::Link(id) => vec![T::from_link(id)],
            Node::Object(object) => vec![object],
            Node::Many(nodes) => nodes.into_iter().flat_map(Node::into_vec).collect(),
            Node::Unknown(_) => Vec::new(),
        }
    }

    /// First entry, or the zero value.
    pub fn into_first(self) -> T {
        self.into_vec().into_iter().next().unwrap_or_default()
    }

    /// Distinct ids of all entries in first-seen order, skipping entries
    /// without one.
    pub fn into_ids(self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.into_vec()
            .into_iter()
            .map(|entry| entry.link_id().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect()
    }
}

/// Deserialize a field, falling back to its zero value on any shape mismatch.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn objects<'de, D>(deserializer: D) -> Result<Vec<Object>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Node::<Object>::from_value(value).into_vec())
}

fn first_object<'de, D>(deserializer: D) -> Result<Option<Box<Object>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let object = Node::<Object>::from_value(value).into_first();
    Ok((object != Object::default()).then(|| Box::new(object)))
}

fn link_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Node::<Object>::from_value(value).into_first().id)
}

fn link_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(Node::<Object>::from_value(value).into_ids())
}

fn context<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Array(entries) => entries
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    })
}

fn actor_as_id<S: Serializer>(actor: &Actor, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&actor.id)
}

fn is_false(value: &bool) -> bool {
    !*value
}

// =============================================================================
// Envelope types
// =============================================================================

/// A post, attachment, preview or nested activity object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Object {
    #[serde(rename = "type", deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(deserialize_with = "link_id", skip_serializing_if = "String::is_empty")]
    pub actor: String,
    #[serde(deserialize_with = "link_id", skip_serializing_if = "String::is_empty")]
    pub attributed_to: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub tripcode: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub href: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(deserialize_with = "objects", skip_serializing_if = "Vec::is_empty")]
    pub in_reply_to: Vec<Object>,
    #[serde(deserialize_with = "objects", skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Object>,
    #[serde(deserialize_with = "first_object", skip_serializing_if = "Option::is_none")]
    pub preview: Option<Box<Object>>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub replies: Option<Box<Collection>>,
    #[serde(deserialize_with = "first_object", skip_serializing_if = "Option::is_none")]
    pub object: Option<Box<Object>>,
    #[serde(deserialize_with = "link_ids", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(deserialize_with = "link_ids", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Posting options such as `sage`
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Vec::is_empty")]
    pub option: Vec<String>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "is_false")]
    pub sensitive: bool,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Object {
    /// Parent post, if this is a reply.
    pub fn parent_id(&self) -> Option<&str> {
        self.in_reply_to
            .first()
            .map(|parent| parent.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.option.iter().any(|o| o == option)
    }
}

/// A remote collection: thread, outbox page, or follower list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Collection {
    #[serde(rename = "@context", deserialize_with = "context", skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(rename = "type", deserialize_with = "lenient")]
    pub kind: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(deserialize_with = "link_id", skip_serializing_if = "String::is_empty")]
    pub actor: String,
    #[serde(deserialize_with = "lenient")]
    pub total_items: i64,
    #[serde(deserialize_with = "objects", skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<Object>,
    #[serde(deserialize_with = "objects", skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Object>,
}

impl Collection {
    /// Entries regardless of which of `orderedItems`/`items` the peer used.
    pub fn members(&self) -> &[Object] {
        if self.ordered_items.is_empty() {
            &self.items
        } else {
            &self.ordered_items
        }
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members()
            .iter()
            .map(|member| member.id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

/// A decoded activity. `actor` is serialized as its id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Activity {
    #[serde(rename = "@context")]
    pub context: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(serialize_with = "actor_as_id")]
    pub actor: Actor,
    pub object: Object,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawActivity {
    #[serde(rename = "type", deserialize_with = "lenient")]
    kind: String,
    #[serde(deserialize_with = "lenient")]
    id: String,
    actor: Value,
    object: Value,
    to: Value,
    cc: Value,
    #[serde(deserialize_with = "lenient")]
    summary: String,
    #[serde(deserialize_with = "lenient")]
    published: Option<DateTime<Utc>>,
}

// =============================================================================
// Decoding
// =============================================================================

/// Whether an `@context` value names the ActivityStreams namespace.
///
/// Accepts a bare string or an array whose first entry is the namespace.
pub fn has_context(context: &Value) -> bool {
    match context {
        Value::String(s) => s == ACTIVITY_STREAMS,
        Value::Array(entries) => entries.first().and_then(Value::as_str) == Some(ACTIVITY_STREAMS),
        _ => false,
    }
}

/// Decode a raw request body into an `Activity`.
///
/// A body without the ActivityStreams context yields `Activity::default()`.
/// A bare `Note` becomes a `Create` wrapping it.
///
/// # Errors
/// `AppError::Validation` if the body is not JSON.
pub fn decode_activity(body: &[u8]) -> Result<Activity, AppError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("malformed activity JSON: {e}")))?;

    if !has_context(value.get("@context").unwrap_or(&Value::Null)) {
        return Ok(Activity::default());
    }

    let raw: RawActivity = serde_json::from_value(value.clone()).unwrap_or_default();

    let (kind, object) = if raw.kind == "Note" {
        ("Create".to_string(), Node::<Object>::from_value(value).into_first())
    } else {
        (raw.kind, Node::<Object>::from_value(raw.object).into_first())
    };

    Ok(Activity {
        context: ACTIVITY_STREAMS.to_string(),
        kind,
        id: raw.id,
        actor: Node::<Actor>::from_value(raw.actor).into_first(),
        object,
        to: Node::<Object>::from_value(raw.to).into_ids(),
        cc: Node::<Object>::from_value(raw.cc).into_ids(),
        summary: raw.summary,
        published: raw.published,
    })
}

/// Whether a `Content-Type`/`Accept` header names an activity media type.
pub fn accept_activity(header: &str) -> bool {
    match header.split_once(';') {
        Some((media_type, _)) => {
            ACTIVITY_MEDIA_TYPE.is_match(media_type.trim())
                || header
                    .rsplit(';')
                    .next()
                    .is_some_and(|last| last.contains(r#"profile="https://www.w3.org/ns/activitystreams""#))
        }
        None => ACTIVITY_MEDIA_TYPE.is_match(header.trim()),
    }
}
