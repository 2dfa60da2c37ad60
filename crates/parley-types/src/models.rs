use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Visible body of a message once it has been soft-deleted.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Who is acting, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Location,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Location => "location",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "location" => Some(Self::Location),
            _ => None,
        }
    }
}

/// Payload supplied by the media/location picker for non-text messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Attachment {
    Image { url: String },
    Location { latitude: f64, longitude: f64 },
}

impl Attachment {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Image { .. } => MessageKind::Image,
            Self::Location { .. } => MessageKind::Location,
        }
    }
}

/// Everything the caller provides for an append. Id and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub group_id: Uuid,
    pub author: Identity,
    pub kind: MessageKind,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub reply_to_id: Option<Uuid>,
}

/// Votes for a single emoji on a single message.
///
/// `count` always equals `voter_ids.len()`. An aggregate with no voters is
/// never stored; it is removed from the message's reaction map instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionAggregate {
    pub emoji: String,
    pub count: usize,
    pub voter_ids: BTreeSet<Uuid>,
}

impl ReactionAggregate {
    pub fn from_voters(emoji: impl Into<String>, voter_ids: BTreeSet<Uuid>) -> Self {
        Self {
            emoji: emoji.into(),
            count: voter_ids.len(),
            voter_ids,
        }
    }

    pub fn empty(emoji: impl Into<String>) -> Self {
        Self::from_voters(emoji, BTreeSet::new())
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.voter_ids.contains(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub group_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub kind: MessageKind,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    /// Weak reference; the target may have left the live window.
    pub reply_to_id: Option<Uuid>,
    pub reactions: BTreeMap<String, ReactionAggregate>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Display order key: creation time, ties broken by id.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// A message document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPresence {
    pub user_id: Uuid,
    pub display_name: String,
    pub last_signal_at: DateTime<Utc>,
}

/// What presence subscribers see: who is typing right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub display_name: String,
}

impl From<&TypingPresence> for TypingUser {
    fn from(p: &TypingPresence) -> Self {
        Self {
            user_id: p.user_id,
            display_name: p.display_name.clone(),
        }
    }
}
