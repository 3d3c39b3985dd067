//! Conversation data model
//!
//! Messages, conversations and the job descriptor that rides inside a
//! message's `extra_metadata` bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::lenient;

/// Open attribute bag attached to a message
pub type ExtraMetadata = Map<String, Value>;

/// Value of `extra_metadata.type` for image jobs
pub const IMAGE_JOB_KIND: &str = "image";

/// Maximum characters kept in a conversation preview
const PREVIEW_CHARS: usize = 100;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human turn
    User,
    /// Model turn
    Assistant,
    /// Client or server notice
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Status of a background job, totally ordered by [`JobStatus::rank`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker
    Queued,
    /// Running
    Processing,
    /// Finished with a result
    Complete,
    /// Finished with a failure
    Error,
}

impl JobStatus {
    /// Position of the status in the job lifecycle
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 1,
            JobStatus::Processing => 2,
            JobStatus::Complete => 3,
            JobStatus::Error => 4,
        }
    }

    /// Whether no further transition is allowed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Wire name of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job descriptor stored in `extra_metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job kind, `"image"` for generated images
    #[serde(rename = "type", default = "image_kind")]
    pub kind: String,
    /// Server-assigned job identifier
    #[serde(deserialize_with = "lenient::id")]
    pub job_id: String,
    /// Current status
    pub status: JobStatus,
    /// Completion percentage
    #[serde(default, deserialize_with = "lenient::progress")]
    pub progress: u8,
    /// Position in the worker queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    /// Result location once complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Failure reason once errored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn image_kind() -> String {
    IMAGE_JOB_KIND.to_string()
}

impl JobDescriptor {
    /// Descriptor for a freshly detected image job
    #[must_use]
    pub fn queued_image(job_id: impl Into<String>) -> Self {
        Self {
            kind: IMAGE_JOB_KIND.to_string(),
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            queue_position: Some(1),
            image_url: None,
            error: None,
        }
    }
}

/// A unit of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Current identity (provisional until migrated)
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    /// Author
    pub role: Role,
    /// Accumulated text
    #[serde(default)]
    pub content: String,
    /// True while a stream is still producing this message
    #[serde(default, rename = "isStreaming", alias = "is_streaming")]
    pub is_streaming: bool,
    /// Reasoning steps received as `thought` events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<String>,
    /// Citation list, replaced wholesale by `sources` events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Value>,
    /// Open attribute bag (job descriptor lives here)
    #[serde(default, deserialize_with = "metadata")]
    pub extra_metadata: ExtraMetadata,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with the given identity
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            is_streaming: false,
            reasoning: Vec::new(),
            sources: Vec::new(),
            extra_metadata: ExtraMetadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Empty assistant message shown while a response is pending
    #[must_use]
    pub fn placeholder(id: impl Into<String>) -> Self {
        let mut message = Self::new(id, Role::Assistant, "");
        message.is_streaming = true;
        message
    }

    /// Job descriptor carried in `extra_metadata`, if any
    #[must_use]
    pub fn job(&self) -> Option<JobDescriptor> {
        if self.job_id().is_none() {
            return None;
        }
        serde_json::from_value(Value::Object(self.extra_metadata.clone())).ok()
    }

    /// Job id referenced by this message
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.extra_metadata.get("job_id").and_then(Value::as_str)
    }

    /// Current job status, if the message carries a job
    #[must_use]
    pub fn job_status(&self) -> Option<JobStatus> {
        self.extra_metadata
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Write the descriptor's fields into `extra_metadata`.
    ///
    /// Keys the descriptor does not know about are left untouched; optional
    /// fields that are `None` are not removed.
    pub fn write_job(&mut self, job: &JobDescriptor) {
        if let Ok(Value::Object(fields)) = serde_json::to_value(job) {
            for (key, value) in fields {
                self.extra_metadata.insert(key, value);
            }
        }
    }

    /// Whether the message holds any visible text
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Attribute bag with a numeric `job_id` normalized to a string
fn metadata<'de, D>(deserializer: D) -> Result<ExtraMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    let mut bag = Option::<ExtraMetadata>::deserialize(deserializer)?.unwrap_or_default();
    if let Some(Value::Number(n)) = bag.get("job_id") {
        let id = n.to_string();
        bag.insert("job_id".to_string(), Value::String(id));
    }
    Ok(bag)
}

/// Ordered container of messages plus summary fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-assigned identity
    #[serde(deserialize_with = "lenient::id")]
    pub id: String,
    /// Display title
    pub title: String,
    /// Short excerpt of the latest message
    pub preview: String,
    /// Number of messages
    #[serde(rename = "messageCount", alias = "message_count")]
    pub message_count: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last structural change
    pub updated_at: DateTime<Utc>,
    /// Messages in display order
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            preview: String::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Recompute `message_count`, `preview` and `updated_at`
    pub fn refresh_summary(&mut self) {
        self.message_count = self.messages.len();
        self.preview = preview_of(&self.messages);
        self.updated_at = Utc::now();
    }
}

/// Preview text for a message list: the latest non-empty content, truncated
#[must_use]
pub fn preview_of(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.has_text())
        .map(|m| truncate_chars(m.content.trim(), PREVIEW_CHARS))
        .unwrap_or_default()
}

/// Title derived from the first user message
#[must_use]
pub fn title_from(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        "New conversation".to_string()
    } else {
        truncate_chars(line, 50)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_rank_is_total() {
        let ordered = [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Complete,
            JobStatus::Error,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }

    #[test]
    fn test_write_job_preserves_foreign_keys() {
        let mut message = Message::new("m1", Role::Assistant, "");
        message
            .extra_metadata
            .insert("model".to_string(), json!("painter-v2"));

        message.write_job(&JobDescriptor::queued_image("J1"));

        assert_eq!(message.extra_metadata["model"], json!("painter-v2"));
        assert_eq!(message.job_id(), Some("J1"));
        assert_eq!(message.job_status(), Some(JobStatus::Queued));
        let job = message.job().unwrap();
        assert_eq!(job.kind, IMAGE_JOB_KIND);
        assert_eq!(job.queue_position, Some(1));
    }

    #[test]
    fn test_message_without_job() {
        let message = Message::new("m1", Role::User, "hello");
        assert!(message.job().is_none());
        assert!(message.job_status().is_none());
    }

    #[test]
    fn test_server_message_with_loose_types() {
        let message: Message = serde_json::from_value(json!({
            "id": 41,
            "role": "assistant",
            "content": "",
            "extra_metadata": {"job_id": 9, "status": "complete", "progress": 100.0}
        }))
        .unwrap();

        assert_eq!(message.id, "41");
        assert_eq!(message.job_id(), Some("9"));
        let job = message.job().unwrap();
        assert_eq!(job.kind, IMAGE_JOB_KIND);
        assert_eq!(job.progress, 100);
        assert_eq!(job.status, JobStatus::Complete);
    }

    #[test]
    fn test_message_serializes_camel_streaming_flag() {
        let message = Message::placeholder("temp-1");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["isStreaming"], json!(true));
        assert_eq!(value["role"], json!("assistant"));
    }

    #[test]
    fn test_refresh_summary() {
        let mut conversation = Conversation::new("c1", "Test");
        conversation
            .messages
            .push(Message::new("1", Role::User, "first question"));
        conversation.messages.push(Message::placeholder("2"));
        conversation.refresh_summary();

        assert_eq!(conversation.message_count, 2);
        assert_eq!(conversation.preview, "first question");
    }

    #[test]
    fn test_title_from_truncates() {
        assert_eq!(title_from("Hi\nsecond line"), "Hi");
        assert_eq!(title_from("   "), "New conversation");
        let long = "x".repeat(80);
        assert_eq!(title_from(&long).chars().count(), 51);
    }
}
