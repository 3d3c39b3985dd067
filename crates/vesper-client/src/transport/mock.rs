//! Scripted transport for testing
//!
//! Replies are queued up front and handed out in order, one per request.
//! Every request is recorded together with the (tokio) instant it arrived so
//! tests running on a paused clock can check retry spacing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use super::{HttpRequest, HttpResponse, Transport};
use crate::error::{Error, Result};

/// One queued reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Respond with a status and a body split into chunks
    Respond {
        /// HTTP status
        status: u16,
        /// Response headers
        headers: Vec<(String, String)>,
        /// Body chunks, delivered one per read
        chunks: Vec<Bytes>,
        /// Keep the body open without sending anything after the chunks
        stall: bool,
        /// Fail the body read after the chunks
        read_error: Option<String>,
    },
    /// Fail before a response head arrives
    Fail(String),
    /// Never answer
    Hang,
}

impl ScriptedReply {
    /// Complete response with the given body
    #[must_use]
    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        ScriptedReply::Respond {
            status,
            headers: Vec::new(),
            chunks: vec![body.into()],
            stall: false,
            read_error: None,
        }
    }

    /// 200 with a JSON body
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::status(200, value.to_string())
    }

    /// 200 whose body arrives in the given pieces
    #[must_use]
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        ScriptedReply::Respond {
            status: 200,
            headers: Vec::new(),
            chunks: chunks.into_iter().map(Into::into).collect(),
            stall: false,
            read_error: None,
        }
    }

    /// Add a response header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let ScriptedReply::Respond { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Keep the body open after the last chunk
    #[must_use]
    pub fn stalled(mut self) -> Self {
        if let ScriptedReply::Respond { stall, .. } = &mut self {
            *stall = true;
        }
        self
    }

    /// Fail the body read after the last chunk
    #[must_use]
    pub fn with_read_error(mut self, message: &str) -> Self {
        if let ScriptedReply::Respond { read_error, .. } = &mut self {
            *read_error = Some(message.to_string());
        }
        self
    }
}

/// A transport that replays queued replies
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<(Instant, HttpRequest)>>>,
}

impl ScriptedTransport {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn push(&self, reply: ScriptedReply) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Arrival instants of the requests received so far
    pub fn call_times(&self) -> Vec<Instant> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(t, _)| *t)
            .collect()
    }

    /// Number of requests received
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Replies not yet consumed
    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), request.clone()));

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match reply {
            Some(ScriptedReply::Respond {
                status,
                headers,
                chunks,
                stall,
                read_error,
            }) => {
                let head: HashMap<String, String> = headers.into_iter().collect();
                let body = stream::iter(chunks.into_iter().map(Ok));
                let body = match (stall, read_error) {
                    (_, Some(message)) => body
                        .chain(stream::once(async move { Err(Error::Stream(message)) }))
                        .boxed(),
                    (true, None) => body.chain(stream::pending()).boxed(),
                    (false, None) => body.boxed(),
                };
                Ok(HttpResponse::new(status, head, body))
            }
            Some(ScriptedReply::Fail(message)) => Err(Error::Network(message)),
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Err(Error::Network(format!(
                "no scripted reply for {} {}",
                request.method, request.path
            ))),
        }
    }
}
