//! Wire events of a streaming send

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vesper_core::lenient;

/// `type` values the decoder understands
pub(crate) const KNOWN_TYPES: &[&str] = &[
    "metadata",
    "chunk",
    "thought",
    "task_result",
    "sources",
    "error",
];

/// One record of a streaming response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Durable identities assigned by the server
    Metadata {
        /// Durable id of the assistant message
        #[serde(
            default,
            alias = "message_id",
            deserialize_with = "lenient::opt_id",
            skip_serializing_if = "Option::is_none"
        )]
        assistant_message_id: Option<String>,
        /// Durable id of the user message
        #[serde(
            default,
            deserialize_with = "lenient::opt_id",
            skip_serializing_if = "Option::is_none"
        )]
        user_message_id: Option<String>,
        /// Conversation the exchange was stored in
        #[serde(
            default,
            deserialize_with = "lenient::opt_id",
            skip_serializing_if = "Option::is_none"
        )]
        conversation_id: Option<String>,
    },
    /// Incremental answer text
    Chunk {
        /// Text to append
        #[serde(default)]
        content: String,
    },
    /// One reasoning step
    Thought {
        /// Step text
        #[serde(default)]
        content: String,
    },
    /// Outcome of a tool invocation
    TaskResult(TaskResult),
    /// Citation list
    Sources {
        /// Replaces the message's citations
        #[serde(default)]
        sources: Vec<Value>,
    },
    /// Fatal in-stream error reported by the server
    Error {
        /// Human-readable reason
        #[serde(default, alias = "error")]
        message: String,
    },
}

impl StreamEvent {
    /// Wire name of the event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Metadata { .. } => "metadata",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Thought { .. } => "thought",
            StreamEvent::TaskResult(_) => "task_result",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Payload of a `task_result` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Job started by the tool, when reported at the top level
    #[serde(
        default,
        deserialize_with = "lenient::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_id: Option<String>,
    /// Tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Raw tool output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskResult {
    /// Job id from the top level or from `result.job_id`
    #[must_use]
    pub fn job_id(&self) -> Option<String> {
        self.job_id.clone().or_else(|| {
            self.result
                .as_ref()
                .and_then(|r| r.get("job_id"))
                .and_then(lenient::id_value)
        })
    }
}
