//! HTTP client for the generation backend

use crate::{
    error::{Error, Result},
    models,
    stream::{ChunkStream, decode_complete_body, decode_full_body, decode_stream},
    types::{GenerateRequest, ImageRequest, ImageResponse, Part},
};
use async_trait::async_trait;
use futures::stream;
use std::time::Duration;

/// The generation backend as seen by a chat session
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start a generation and return its decoded chunk sequence.
    ///
    /// A non-success status fails here, before any chunk is produced.
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream>;

    /// Run a text-to-image generation; returns exactly one completed result.
    async fn generate_image(&self, parts: &[Part]) -> Result<Vec<Part>>;
}

/// Endpoint and client settings
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Server origin, e.g. `http://localhost:5174`
    pub base_url: String,
    pub stream_path: String,
    pub text_path: String,
    pub image_path: String,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Connect timeout; streamed bodies are never cut by a read deadline
    pub connect_timeout: Option<Duration>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5174".to_string(),
            stream_path: "/api/gemini/generate-stream".to_string(),
            text_path: "/api/gemini/generate".to_string(),
            image_path: "/api/gemini/generate-image".to_string(),
            default_model: models::DEFAULT_MODEL.to_string(),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl GeneratorConfig {
    /// Config pointing at a server origin, other settings default
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set the default model
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// reqwest-backed [`Generator`]
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GeneratorConfig,
}

impl HttpGenerator {
    /// Create a client for the given config
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "base URL must start with http:// or https://, got '{}'",
                config.base_url
            )));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    /// Get the client config
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// One-shot, non-streaming text generation.
    ///
    /// Returns the `text` field of the response, empty when absent.
    pub async fn generate_text(&self, prompt: &str, model: Option<&str>) -> Result<String> {
        let url = self.config.url(&self.config.text_path);
        let request = GenerateRequest {
            prompt: Some(prompt.to_string()),
            model: Some(model.unwrap_or(&self.config.default_model).to_string()),
            ..Default::default()
        };

        tracing::debug!("POST {}", url);
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::status(status, body));
        }

        let body = response.bytes().await?;
        Ok(decode_full_body(&body)
            .and_then(|c| c.text)
            .unwrap_or_default())
    }
}

/// A response that arrived as one complete JSON document rather than a
/// flushed stream.
fn is_complete_json(response: &reqwest::Response) -> bool {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    is_json && response.content_length().is_some()
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream> {
        let url = self.config.url(&self.config.stream_path);
        tracing::debug!(
            "POST {} (model={:?}, parts={}, history={})",
            url,
            request.model,
            request.parts.as_ref().map_or(0, Vec::len),
            request.history.as_ref().map_or(0, Vec::len),
        );

        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::status(status, body));
        }

        if is_complete_json(&response) {
            let body = response.bytes().await?;
            return Ok(Box::pin(stream::iter(
                decode_complete_body(&body).into_iter().map(Ok),
            )));
        }

        Ok(decode_stream(response.bytes_stream()))
    }

    async fn generate_image(&self, parts: &[Part]) -> Result<Vec<Part>> {
        let url = self.config.url(&self.config.image_path);
        tracing::debug!("POST {} ({} parts)", url, parts.len());

        let request = ImageRequest {
            parts: parts.to_vec(),
        };
        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Image { status, body });
        }

        let body: ImageResponse = response.json().await?;
        Ok(body.parts)
    }
}
