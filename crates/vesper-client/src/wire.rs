//! JSON shapes shared by several endpoints

use serde::{Deserialize, Serialize};
use vesper_core::lenient;
use vesper_core::model::JobStatus;
use vesper_core::reconciler::JobUpdate;

/// Job status as reported by the status endpoint and by push frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Job identifier
    #[serde(deserialize_with = "lenient::id")]
    pub job_id: String,
    /// Message the job belongs to
    #[serde(default, deserialize_with = "lenient::opt_id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Reported status
    pub status: JobStatus,
    /// Completion percentage
    #[serde(default, deserialize_with = "lenient::opt_progress", skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Position in the worker queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    /// Result location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Conversation the job belongs to
    #[serde(default, deserialize_with = "lenient::opt_id", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl JobReport {
    /// Reconciler input for this report
    #[must_use]
    pub fn into_update(self) -> JobUpdate {
        JobUpdate {
            job_id: self.job_id,
            message_id: self.message_id,
            status: self.status,
            progress: self.progress,
            queue_position: self.queue_position,
            image_url: self.image_url,
            error: self.error,
            conversation_id: self.conversation_id,
        }
    }
}

/// Reply of the cancel endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancelReply {
    /// Whether the backend cancelled the job
    pub success: bool,
    /// Explanation
    #[serde(default)]
    pub message: String,
}

/// Reply of the upload endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadReply {
    /// Where the uploaded file can be fetched
    pub url: String,
}
