//! Conversation state: id, title, and the ordered message list.

use parley_ai::{ChatMessage, ChatSession};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a conversation, assigned once at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Assign a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A conversation as held by the store.
///
/// Messages are shared `Arc`s: a message that changes is replaced by a new
/// allocation, so `Arc::ptr_eq` tells observers whether it changed.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Arc<ChatMessage>>,
    /// Session used to send this conversation's turns
    pub session: Option<ChatSession>,
    /// Whether the last message is a placeholder still being filled
    pub streaming: bool,
    /// Last change, milliseconds since the epoch
    pub updated_at: i64,
}

impl Conversation {
    /// Create an empty conversation titled after its first message
    pub fn new(id: ConversationId, first_text: &str) -> Self {
        Self {
            id,
            title: title_from(first_text),
            messages: Vec::new(),
            session: None,
            streaming: false,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild a conversation loaded from persistence
    pub fn restored(
        summary: ConversationSummary,
        messages: Vec<ChatMessage>,
        session: Option<ChatSession>,
    ) -> Self {
        Self {
            id: summary.id,
            title: summary.title,
            messages: messages.into_iter().map(Arc::new).collect(),
            session,
            streaming: false,
            updated_at: summary.updated_at,
        }
    }

    /// The last message, if any
    pub fn last(&self) -> Option<&Arc<ChatMessage>> {
        self.messages.last()
    }

    /// Summary row for listings
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            model: self.session.as_ref().map(|s| s.default_model().to_string()),
            updated_at: self.updated_at,
        }
    }
}

/// Listing row for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Milliseconds since the epoch
    pub updated_at: i64,
}

/// First five words of the opening message, or "New Chat"
pub fn title_from(text: &str) -> String {
    let title = text.split_whitespace().take(5).collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        "New Chat".to_string()
    } else {
        title
    }
}
