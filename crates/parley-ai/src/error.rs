//! Error types for parley-ai

use thiserror::Error;

/// Result type alias using parley-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the generation backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed or the connection dropped mid-body
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The generation endpoint answered with a non-success status
    #[error("Server responded {status}: {body}")]
    Status { status: u16, body: String },

    /// The image endpoint answered with a non-success status
    #[error("Image API error {status}: {body}")]
    Image { status: u16, body: String },

    /// Request was aborted by the caller
    #[error("Request aborted")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    /// Create a status error from a code and response body
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } | Error::Image { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the server rejected the request shape (4xx).
    pub fn is_validation(&self) -> bool {
        matches!(self.status_code(), Some(400..=499))
    }

    /// The `error` field of a JSON error body, e.g. `{"error": "Missing 'prompt'"}`.
    pub fn server_message(&self) -> Option<String> {
        let body = match self {
            Error::Status { body, .. } | Error::Image { body, .. } => body,
            _ => return None,
        };
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        value
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
    }
}
