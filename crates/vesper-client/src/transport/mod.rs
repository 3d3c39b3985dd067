//! HTTP transport seam
//!
//! The executor talks to the network only through [`Transport`]. Responses
//! expose their body as a byte stream, so the same seam serves both plain
//! JSON calls and streaming sends.
//!
//! - `ReqwestTransport`: the production implementation
//! - `ScriptedTransport`: replays queued replies, for tests and demos

mod mock;

pub use mock::{ScriptedReply, ScriptedTransport};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Body of a response, delivered incrementally
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// HTTP verbs the client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// Upper-case verb
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request addressed by path relative to the server base URL
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Verb
    pub method: Method,
    /// Path starting with `/`, or an absolute URL
    pub path: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl HttpRequest {
    /// GET request
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST request with a JSON body
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response head plus an unread body
pub struct HttpResponse {
    /// HTTP status
    pub status: u16,
    headers: HashMap<String, String>,
    body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Build a response from its parts; header names are matched
    /// case-insensitively
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: ByteStream) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with a body that is already in memory
    #[must_use]
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, HashMap::new(), stream::once(async move { Ok(body) }).boxed())
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Header value by name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Take the body stream
    #[must_use]
    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Read the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Something that can carry an [`HttpRequest`]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return once the response head is available
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by `reqwest`
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Create a transport for the configured server
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vesper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create a transport around an existing client
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: &ServerConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        }
    }

    /// Absolute URLs are used as given
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.url(&request.path);
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map_err(|e| Error::Stream(e.to_string()))
            .boxed();

        Ok(HttpResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_headers_are_case_insensitive() {
        let response = HttpResponse::from_bytes(200, "{}").with_header("X-Conversation-Id", "c1");
        assert_eq!(response.header("x-conversation-id"), Some("c1"));
        assert!(response.is_success());
        assert_eq!(response.bytes().await.unwrap(), Bytes::from("{}"));
    }

    #[test]
    fn test_request_builders() {
        let request = HttpRequest::post("/api/chat", serde_json::json!({"message": "Hi"}))
            .with_header("accept", "application/x-ndjson");
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(HttpRequest::get("/x").method.to_string(), "GET");
    }

    #[test]
    fn test_reqwest_transport_joins_paths() {
        let config = ServerConfig {
            base_url: "https://chat.example.com/".to_string(),
            api_token: None,
        };
        let transport = ReqwestTransport::new(&config).unwrap();
        assert_eq!(
            transport.url("/api/chat"),
            "https://chat.example.com/api/chat"
        );
        assert_eq!(
            transport.url("https://events.example.com/batch"),
            "https://events.example.com/batch"
        );
    }
}
