//! Core types for conversations and the generation wire format

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Typed by the person chatting
    User,
    /// Produced by the generation backend
    Model,
    /// A failed turn, rendered in place of the model reply
    Error,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Error => "error",
        }
    }
}

/// Base64 payload with its mime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// Base64 encoded bytes
    pub data: String,
    pub mime_type: String,
}

/// One piece of message content: text, inline data, or (rarely) both
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    /// Create a text part
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    /// Create an inline data part from base64 data
    pub fn inline(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                data: data.into(),
                mime_type: mime_type.into(),
            }),
        }
    }

    /// Get text if this part carries any
    pub fn as_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Whether the part carries non-empty text
    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the part carries inline (image) data
    pub fn has_inline_data(&self) -> bool {
        self.inline_data.is_some()
    }
}

/// A citation attached to a model reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl GroundingSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: None,
        }
    }

    pub fn with_title(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: Some(title.into()),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<GroundingSource>>,
}

impl ChatMessage {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::user_with_parts(vec![Part::text(text)])
    }

    /// Create a user message with multiple parts
    pub fn user_with_parts(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
            sources: None,
        }
    }

    /// Create a model message carrying text and its sources
    pub fn model(text: impl Into<String>, sources: Vec<GroundingSource>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
            sources: Some(sources),
        }
    }

    /// Create a model message from returned parts (image results)
    pub fn model_with_parts(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
            sources: None,
        }
    }

    /// The empty model message that reserves the reply slot
    pub fn placeholder() -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text("")],
            sources: None,
        }
    }

    /// Create an error message describing a failed turn
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            role: Role::Error,
            parts: vec![Part::text(text)],
            sources: None,
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether any part carries non-empty text
    pub fn has_text(&self) -> bool {
        self.parts.iter().any(Part::has_text)
    }

    /// Grounding sources, empty when none were attached
    pub fn sources(&self) -> &[GroundingSource] {
        self.sources.as_deref().unwrap_or_default()
    }
}

/// Roles allowed in the history sent back to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Model,
}

/// A prior turn sent back for context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub parts: Vec<Part>,
}

/// Body of a generation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Body of an image generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub parts: Vec<Part>,
}

/// Body returned by the image endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ImageResponse {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A web citation inside grounding metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_chunks: Option<Vec<GroundingChunk>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One generation candidate as forwarded by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<CandidateContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<GroundingMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One decoded unit of streamed output.
///
/// Only `text` and `candidates` are interpreted; every other field the server
/// emitted is kept in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamChunk {
    /// A chunk carrying only text
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Build a chunk from a parsed JSON object without ever failing.
    ///
    /// Fields whose shape does not match (e.g. a numeric `text`) stay in `extra`.
    pub fn from_object(mut object: Map<String, Value>) -> Self {
        let text = match object.remove("text") {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                object.insert("text".to_string(), other);
                None
            }
            None => None,
        };

        let candidates = match object.remove("candidates") {
            Some(value) => match serde_json::from_value::<Vec<Candidate>>(value.clone()) {
                Ok(c) => Some(c),
                Err(_) => {
                    object.insert("candidates".to_string(), value);
                    None
                }
            },
            None => None,
        };

        Self {
            text,
            candidates,
            extra: object,
        }
    }

    /// Text carried by this chunk, empty if none
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Web citations of the first candidate, in arrival order
    pub fn sources(&self) -> Vec<GroundingSource> {
        self.candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.grounding_metadata.as_ref())
            .and_then(|m| m.grounding_chunks.as_ref())
            .map(|chunks| {
                chunks
                    .iter()
                    .filter_map(|c| c.web.as_ref())
                    .filter(|web| !web.uri.is_empty())
                    .map(|web| GroundingSource {
                        uri: web.uri.clone(),
                        title: web.title.clone().filter(|t| !t.is_empty()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
