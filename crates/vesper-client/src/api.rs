//! Typed chat API
//!
//! Thin wrappers around the executor for each backend endpoint, plus the
//! two seams the orchestrator and poller depend on: [`JobStatusSource`] and
//! [`Uploader`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use vesper_core::model::Message;

use crate::config::{ClientConfig, EndpointConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::executor::{Executor, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse};
use crate::wire::{CancelReply, JobReport, UploadReply};

/// Body of the streaming send endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendRequest {
    /// User text
    pub message: String,
    /// Target conversation; `null` starts a new one
    pub conversation_id: Option<String>,
    /// Assistant persona
    pub persona: String,
    /// Always `true`
    pub stream: bool,
    /// Writing style profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_profile: Option<String>,
    /// Uploaded attachment URLs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Image generation settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_settings: Option<Value>,
}

/// A file to upload before sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Original file name
    pub filename: String,
    /// MIME type
    pub mime_type: String,
    /// Raw content
    pub data: Vec<u8>,
}

impl Attachment {
    /// Create an attachment
    #[must_use]
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Where job status can be looked up by id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    /// Current status of a job
    async fn job_status(&self, job_id: &str) -> Result<JobReport>;
}

/// Upload capability for attachments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload one attachment and return its URL
    async fn upload(&self, attachment: &Attachment) -> Result<String>;
}

/// Client for the chat backend
#[derive(Debug, Clone)]
pub struct ChatApi {
    executor: Executor,
    endpoints: EndpointConfig,
    stream: StreamConfig,
}

impl ChatApi {
    /// Create an API client on top of an executor
    #[must_use]
    pub fn new(executor: Executor, config: &ClientConfig) -> Self {
        Self {
            executor,
            endpoints: config.endpoints.clone(),
            stream: config.stream.clone(),
        }
    }

    /// The underlying executor
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Name of the header carrying a new conversation id
    #[must_use]
    pub fn conversation_header(&self) -> &str {
        &self.stream.conversation_header
    }

    /// Start a streaming send.
    ///
    /// The send is never retried: a second POST could create a second
    /// exchange on the server.
    pub async fn open_send(&self, request: &SendRequest) -> Result<HttpResponse> {
        let body = serde_json::to_value(request).map_err(|e| Error::MalformedResponse {
            endpoint: self.endpoints.send.clone(),
            method: "POST".to_string(),
            reason: e.to_string(),
        })?;
        let http = HttpRequest::post(self.endpoints.send.clone(), body)
            .with_header("accept", "application/x-ndjson");
        self.executor
            .open_stream(http, self.stream.send_timeout())
            .await
    }

    /// Ask the backend to cancel a job
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelReply> {
        let path = self.endpoints.job_cancel_path(job_id);
        let reply: CancelReply = self
            .executor
            .execute_json(HttpRequest::post(path, json!({})))
            .await?;
        info!(job_id = %job_id, success = reply.success, "Cancel requested");
        Ok(reply)
    }

    /// Authoritative message list of a conversation
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let path = self.endpoints.messages_path(conversation_id);
        let value = self.executor.execute(HttpRequest::get(path.clone())).await?;

        // Either a bare array or `{ "messages": [...] }`
        let list = match value {
            Value::Object(mut map) => map.remove("messages").unwrap_or(Value::Null),
            other => other,
        };
        let messages: Vec<Message> =
            serde_json::from_value(list).map_err(|e| Error::MalformedResponse {
                endpoint: path,
                method: "GET".to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "Loaded messages"
        );
        Ok(messages)
    }

    /// Status lookup with an explicit retry policy
    pub async fn job_status_with(&self, job_id: &str, policy: &RetryPolicy) -> Result<JobReport> {
        let path = self.endpoints.job_status_path(job_id);
        let value = self
            .executor
            .execute_with(HttpRequest::get(path.clone()), policy)
            .await?;
        serde_json::from_value(value).map_err(|e| Error::MalformedResponse {
            endpoint: path,
            method: "GET".to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl JobStatusSource for ChatApi {
    async fn job_status(&self, job_id: &str) -> Result<JobReport> {
        self.job_status_with(job_id, self.executor.policy()).await
    }
}

#[async_trait]
impl Uploader for ChatApi {
    async fn upload(&self, attachment: &Attachment) -> Result<String> {
        let body = json!({
            "filename": attachment.filename,
            "mime_type": attachment.mime_type,
            "data": BASE64.encode(&attachment.data),
        });
        let reply: UploadReply = self
            .executor
            .execute_json(HttpRequest::post(self.endpoints.upload.clone(), body))
            .await
            .map_err(|e| Error::Upload(e.to_string()))?;
        debug!(filename = %attachment.filename, url = %reply.url, "Uploaded attachment");
        Ok(reply.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Method, ScriptedReply, ScriptedTransport};
    use std::sync::Arc;
    use std::time::Duration;
    use vesper_core::model::JobStatus;
    use vesper_core::observer::ObserverHandle;

    fn api(transport: &ScriptedTransport) -> ChatApi {
        let executor = Executor::new(Arc::new(transport.clone()), ObserverHandle::noop())
            .with_policy(
                RetryPolicy::new()
                    .with_timeout(Duration::from_secs(1))
                    .with_backoff_base(Duration::from_millis(10)),
            );
        ChatApi::new(executor, &ClientConfig::default())
    }

    #[test]
    fn test_send_request_shape() {
        let request = SendRequest {
            message: "Hi".to_string(),
            conversation_id: None,
            persona: "default".to_string(),
            stream: true,
            style_profile: None,
            images: Vec::new(),
            image_settings: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"message": "Hi", "conversation_id": null, "persona": "default", "stream": true})
        );
    }

    #[tokio::test]
    async fn test_job_status_parses_report() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(&json!({
            "job_id": "J1",
            "status": "complete",
            "progress": 100,
            "queue_position": null,
            "image_url": "/x.png"
        })));

        let report = api(&transport).job_status("J1").await.unwrap();

        assert_eq!(report.status, JobStatus::Complete);
        assert_eq!(report.image_url.as_deref(), Some("/x.png"));
        assert_eq!(transport.requests()[0].path, "/api/jobs/J1");
    }

    #[tokio::test]
    async fn test_cancel_posts_to_job() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(
            &json!({"success": true, "message": "cancelled"}),
        ));

        let reply = api(&transport).cancel_job("J7").await.unwrap();

        assert!(reply.success);
        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/api/jobs/J7/cancel");
    }

    #[tokio::test]
    async fn test_list_messages_accepts_both_shapes() {
        let transport = ScriptedTransport::new();
        transport
            .push(ScriptedReply::json(&json!([
                {"id": "1", "role": "user", "content": "Hi"}
            ])))
            .push(ScriptedReply::json(&json!({"messages": [
                {"id": "1", "role": "user", "content": "Hi"},
                {"id": "2", "role": "assistant", "content": "Hello"}
            ]})));
        let api = api(&transport);

        assert_eq!(api.list_messages("c1").await.unwrap().len(), 1);
        assert_eq!(api.list_messages("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_encodes_payload() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::json(&json!({"url": "/files/cat.png"})));

        let url = api(&transport)
            .upload(&Attachment::new("cat.png", "image/png", vec![1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(url, "/files/cat.png");
        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(body["filename"], "cat.png");
        assert_eq!(body["mime_type"], "image/png");
        assert_eq!(body["data"], "AQID");
    }

    #[tokio::test]
    async fn test_upload_failure_is_upload_error() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::status(413, r#"{"detail":"too large"}"#));

        let err = api(&transport)
            .upload(&Attachment::new("big.png", "image/png", vec![0; 8]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upload(msg) if msg.contains("too large")));
    }
}
