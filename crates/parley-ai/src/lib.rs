//! parley-ai: wire types, stream decoding and the HTTP client for the
//! generation backend.
//!
//! The backend answers either with one JSON object or with a chunked body of
//! newline-delimited JSON and plain text. [`stream::decode_stream`] turns
//! either shape into a lazy sequence of [`StreamChunk`]s, and
//! [`ChatSession`] shapes outbound requests on top of a [`Generator`].

pub mod client;
pub mod error;
pub mod models;
pub mod session;
pub mod stream;
pub mod types;

pub use client::{Generator, GeneratorConfig, HttpGenerator};
pub use error::{Error, Result};
pub use session::{ChatSession, SendMessageArgs};
pub use stream::ChunkStream;
pub use types::*;
