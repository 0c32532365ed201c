//! Data models
//!
//! Actors, key references and stored objects. Actors double as the JSON
//! actor document exchanged with peers; stored objects are the flat rows
//! behind local posts and cached remote posts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::federation::envelope::lenient;

// =============================================================================
// Actor
// =============================================================================

/// Capability bitmask carried by board actors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardOptions(pub i64);

impl BoardOptions {
    pub const ID: BoardOptions = BoardOptions(1);
    pub const FLAG: BoardOptions = BoardOptions(2);
    pub const TRIPCODE: BoardOptions = BoardOptions(4);
    pub const ANONYMOUS: BoardOptions = BoardOptions(8);
    pub const READ_ONLY: BoardOptions = BoardOptions(16);

    pub fn contains(self, other: BoardOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: BoardOptions) -> BoardOptions {
        BoardOptions(self.0 | other.0)
    }
}

/// Public key reference published in an actor document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

/// A federated identity: a local board, the instance itself, or a remote peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Actor {
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(rename = "type", deserialize_with = "lenient")]
    pub kind: String,
    #[serde(deserialize_with = "lenient")]
    pub preferred_username: String,
    #[serde(deserialize_with = "lenient")]
    pub name: String,
    #[serde(deserialize_with = "lenient")]
    pub summary: String,
    #[serde(deserialize_with = "lenient")]
    pub inbox: String,
    #[serde(deserialize_with = "lenient")]
    pub outbox: String,
    #[serde(deserialize_with = "lenient")]
    pub following: String,
    #[serde(deserialize_with = "lenient")]
    pub followers: String,
    #[serde(deserialize_with = "lenient")]
    pub restricted: bool,
    #[serde(deserialize_with = "lenient")]
    pub options_mask: BoardOptions,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Follow back new followers automatically. Local setting, never published.
    #[serde(skip)]
    pub auto_subscribe: bool,
}

impl Actor {
    /// Build a local board actor rooted at `base_url`.
    ///
    /// The main actor (`name == "main"`) lives at the base URL itself.
    pub fn new_board(base_url: &str, name: &str, title: &str, summary: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let id = if name == "main" {
            base.to_string()
        } else {
            format!("{base}/{name}")
        };

        Self {
            kind: "Group".to_string(),
            preferred_username: name.to_string(),
            name: title.to_string(),
            summary: summary.to_string(),
            inbox: format!("{id}/inbox"),
            outbox: format!("{id}/outbox"),
            following: format!("{id}/following"),
            followers: format!("{id}/followers"),
            public_key: Some(PublicKey {
                id: format!("{id}#main-key"),
                owner: id.clone(),
                public_key_pem: String::new(),
            }),
            id,
            ..Default::default()
        }
    }

    pub fn has_option(&self, option: BoardOptions) -> bool {
        self.options_mask.contains(option)
    }

    pub fn is_read_only(&self) -> bool {
        self.has_option(BoardOptions::READ_ONLY)
    }

    /// The instance-level actor, whose id has no path.
    pub fn is_main(&self) -> bool {
        self.preferred_username == "main" || crate::federation::ident::is_main_actor_id(&self.id)
    }

    pub fn public_key_id(&self) -> Option<&str> {
        self.public_key
            .as_ref()
            .map(|key| key.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Inbox to deliver to, falling back to the conventional `<id>/inbox`.
    pub fn inbox_url(&self) -> String {
        if self.inbox.is_empty() {
            format!("{}/inbox", self.id)
        } else {
            self.inbox.clone()
        }
    }

    /// Actor document as served to peers.
    pub fn to_document(&self) -> serde_json::Value {
        let mut document = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = document.as_object_mut() {
            map.insert(
                "@context".to_string(),
                serde_json::Value::String(crate::federation::envelope::ACTIVITY_STREAMS.to_string()),
            );
        }
        document
    }
}

// =============================================================================
// Stored objects
// =============================================================================

/// Where a stored object came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOrigin {
    /// Authored on this instance
    Local,
    /// Mirrored from a remote peer
    Cache,
}

impl ObjectOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectOrigin::Local => "local",
            ObjectOrigin::Cache => "cache",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "local" {
            ObjectOrigin::Local
        } else {
            ObjectOrigin::Cache
        }
    }
}

/// Flat row for a post, attachment or preview.
///
/// Thread structure is not stored here; it lives in the reply-edge relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub id: String,
    pub origin: ObjectOrigin,
    pub kind: String,
    pub name: String,
    pub content: String,
    pub actor: String,
    pub attributed_to: String,
    pub tripcode: String,
    pub href: String,
    pub media_type: String,
    pub size: i64,
    /// Id of the first attachment row, if any
    pub attachment: String,
    /// Id of the preview row, if any
    pub preview: String,
    pub sensitive: bool,
    pub published: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, origin: ObjectOrigin) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            origin,
            kind: kind.into(),
            name: String::new(),
            content: String::new(),
            actor: String::new(),
            attributed_to: String::new(),
            tripcode: String::new(),
            href: String::new(),
            media_type: String::new(),
            size: 0,
            attachment: String::new(),
            preview: String::new(),
            sensitive: false,
            published: now,
            updated: now,
            deleted: None,
        }
    }
}
