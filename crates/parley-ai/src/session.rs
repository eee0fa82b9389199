//! Chat session: request shaping on top of a [`Generator`]

use crate::{
    client::Generator,
    error::Result,
    stream::ChunkStream,
    types::{GenerateRequest, HistoryMessage, Part},
};
use std::sync::Arc;

/// Arguments for one outbound turn
#[derive(Debug, Clone, Default)]
pub struct SendMessageArgs {
    /// Plain text of the turn
    pub message: String,
    /// Prior turns, oldest first
    pub history: Vec<HistoryMessage>,
    /// Multimodal parts; preferred over `message` when non-empty
    pub parts: Vec<Part>,
    /// Model id; the session default applies when absent
    pub model: Option<String>,
}

/// A lightweight handle that sends turns to the backend.
///
/// Cloning is cheap. Calls on one session are sequential: the caller must not
/// drive two streams for the same conversation at once.
#[derive(Clone)]
pub struct ChatSession {
    generator: Arc<dyn Generator>,
    default_model: String,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Create a session over a generator
    pub fn new(generator: Arc<dyn Generator>, default_model: impl Into<String>) -> Self {
        Self {
            generator,
            default_model: default_model.into(),
        }
    }

    /// Get the default model
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Get the underlying generator
    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    /// Shape the request body for a turn
    pub fn build_request(&self, args: &SendMessageArgs) -> GenerateRequest {
        let (prompt, parts) = if args.parts.is_empty() {
            (Some(args.message.clone()), None)
        } else {
            (None, Some(args.parts.clone()))
        };

        let history = if args.history.is_empty() {
            None
        } else {
            Some(args.history.clone())
        };

        let model = args
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        if !crate::models::is_known(&model) {
            tracing::debug!("Sending turn with unlisted model '{}'", model);
        }

        GenerateRequest {
            prompt,
            parts,
            history,
            model: Some(model),
        }
    }

    /// Send a turn and return the decoded chunk sequence unmodified
    pub async fn send_message_stream(&self, args: SendMessageArgs) -> Result<ChunkStream> {
        let request = self.build_request(&args);
        self.generator.generate_stream(&request).await
    }

    /// Run a text-to-image generation for the given parts
    pub async fn generate_image(&self, parts: &[Part]) -> Result<Vec<Part>> {
        self.generator.generate_image(parts).await
    }
}
