//! Decoding of generation response bodies into [`StreamChunk`]s.
//!
//! A body is a sequence of newline-terminated lines. Each line is tried as
//! JSON: an object becomes a chunk verbatim, anything else becomes a
//! text-only chunk. Bytes are buffered until a newline arrives, so the
//! decoded sequence does not depend on how the transport split the body.

use crate::{
    error::{Error, Result},
    types::StreamChunk,
};
use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::pin::Pin;
use tokio_stream::Stream;

/// A lazy, single-pass stream of decoded chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Incremental line decoder. Feed it reads as they arrive, then call
/// [`LineDecoder::finish`] once the body ends.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and return every chunk completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        // The buffer never holds a newline between calls
        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(chunk) = decode_line(&line[..end]) {
                chunks.push(chunk);
            }
            search_from = 0;
        }
        chunks
    }

    /// Flush whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<StreamChunk> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one line. Blank lines produce nothing.
pub fn decode_line(line: &[u8]) -> Option<StreamChunk> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(object)) => Some(StreamChunk::from_object(object)),
        Ok(Value::String(s)) => Some(StreamChunk::from_text(s)),
        Ok(_) | Err(_) => Some(StreamChunk::from_text(trimmed)),
    }
}

/// Decode a complete, non-streamed body as a single JSON object.
///
/// Yields a chunk only when the object has a non-empty `text` field.
pub fn decode_full_body(body: &[u8]) -> Option<StreamChunk> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Non-streaming body is not JSON: {}", e);
            return None;
        }
    };

    full_body_text(&value)
}

fn full_body_text(value: &Value) -> Option<StreamChunk> {
    value
        .get("text")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(StreamChunk::from_text)
}

/// Decode a body that was delivered in one piece.
///
/// A single JSON document is read like [`decode_full_body`]; anything else
/// goes through [`LineDecoder`], so newline-delimited bodies labelled as
/// JSON still yield every line.
pub fn decode_complete_body(body: &[u8]) -> Vec<StreamChunk> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return full_body_text(&value).into_iter().collect();
    }

    let mut decoder = LineDecoder::new();
    let mut chunks = decoder.feed(body);
    chunks.extend(decoder.finish());
    tracing::debug!("Complete body decoded line by line into {} chunks", chunks.len());
    chunks
}

/// Turn a byte stream into a lazy chunk stream.
///
/// A transport error ends the stream after being yielded once.
pub fn decode_stream<S, E>(body: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    Box::pin(stream! {
        let mut body = Box::pin(body);
        let mut decoder = LineDecoder::new();
        let mut yielded = 0usize;

        while let Some(read) = body.next().await {
            match read {
                Ok(bytes) => {
                    for chunk in decoder.feed(&bytes) {
                        yielded += 1;
                        yield Ok(chunk);
                    }
                }
                Err(e) => {
                    let e: Error = e.into();
                    tracing::warn!("Body read failed after {} chunks: {}", yielded, e);
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(chunk) = decoder.finish() {
            yielded += 1;
            yield Ok(chunk);
        }
        tracing::debug!("Body decoded into {} chunks", yielded);
    })
}
