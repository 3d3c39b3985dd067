//! Streaming event decoder
//!
//! Turns an incrementally delivered body of newline-delimited JSON into a
//! lazy sequence of [`DecodedItem`]s. Records may be split across reads at
//! any byte, including inside a multi-byte UTF-8 sequence, so bytes are
//! buffered and only complete lines are decoded.
//!
//! A line that is not a JSON object with a `type` field is legacy plain text
//! and comes out as [`DecodedItem::Text`]. Objects with an unknown `type`
//! are logged and skipped.

mod event;

pub use event::{StreamEvent, TaskResult};

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::ByteStream;

/// One decoded line
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedItem {
    /// A structured event
    Event(StreamEvent),
    /// Legacy plain text, newline included
    Text(String),
}

/// Incremental line splitter and parser
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns the items of every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedItem> {
        self.buffer.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(item) = decode_line(&line[..line.len() - 1]) {
                items.push(item);
            }
        }
        items
    }

    /// Flush the trailing fragment at end of stream
    pub fn finish(&mut self) -> Option<DecodedItem> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Bytes waiting for a newline
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one line without its terminating newline
pub fn decode_line(raw: &[u8]) -> Option<DecodedItem> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }

    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(_) => return Some(legacy(line)),
    };

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Some(legacy(line)),
    };

    if !event::KNOWN_TYPES.contains(&kind.as_str()) {
        debug!(kind = %kind, "Skipping stream event of unknown type");
        return None;
    }

    match serde_json::from_value::<StreamEvent>(value) {
        Ok(event) => Some(DecodedItem::Event(event)),
        Err(e) => {
            warn!(kind = %kind, error = %e, "Skipping malformed stream event");
            None
        }
    }
}

fn legacy(line: &str) -> DecodedItem {
    let mut text = line.to_string();
    text.push('\n');
    DecodedItem::Text(text)
}

/// Decode a body stream.
///
/// Each read must arrive within `idle_timeout`; a stall ends the sequence
/// with [`Error::StreamTimeout`]. Read errors end it with that error. A
/// clean end of body flushes any trailing fragment and ends normally.
pub fn decode_stream(
    body: ByteStream,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<DecodedItem>> + Send {
    async_stream::stream! {
        let mut body = body;
        let mut decoder = LineDecoder::new();

        loop {
            match tokio::time::timeout(idle_timeout, body.next()).await {
                Err(_) => {
                    warn!(
                        idle_secs = idle_timeout.as_secs(),
                        pending_bytes = decoder.pending(),
                        "Stream stalled"
                    );
                    yield Err(Error::StreamTimeout(idle_timeout.as_secs()));
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    for item in decoder.push(&chunk) {
                        yield Ok(item);
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Stream read failed");
                    yield Err(e);
                    break;
                }
                Ok(None) => {
                    if let Some(item) = decoder.finish() {
                        yield Ok(item);
                    }
                    debug!("Stream ended");
                    break;
                }
            }
        }
    }
}
