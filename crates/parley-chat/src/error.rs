//! Error types for parley-chat

use crate::conversation::ConversationId;
use thiserror::Error;

/// Result type alias using parley-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during conversation operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the generation client
    #[error(transparent)]
    Ai(#[from] parley_ai::Error),

    /// No conversation with this id
    #[error("Conversation not found: {0}")]
    UnknownConversation(ConversationId),

    /// Edit index past the end of the message list
    #[error("Message index {index} out of range (conversation has {len} messages)")]
    IndexOutOfRange { index: usize, len: usize },

    /// A turn is already in flight
    #[error("A reply is already being generated")]
    Busy,

    /// A chunk arrived for a conversation whose reply is already final
    #[error("Conversation {0} has no reply in flight")]
    NotStreaming(ConversationId),

    /// The turn was aborted by the caller
    #[error("Request aborted")]
    Aborted,

    /// The persistence adapter failed
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Wrap any displayable failure as a persistence error
    pub fn persistence(e: impl std::fmt::Display) -> Self {
        Self::Persistence(e.to_string())
    }

    /// Text shown in the error-role message that replaces a failed reply.
    ///
    /// Validation failures show the server's own `error` text.
    pub fn describe(&self) -> String {
        match self {
            Error::Ai(e) if e.is_validation() => {
                e.server_message().unwrap_or_else(|| e.to_string())
            }
            Error::Ai(parley_ai::Error::Aborted) => Error::Aborted.to_string(),
            other => other.to_string(),
        }
    }
}
