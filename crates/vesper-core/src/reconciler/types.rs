use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::JobStatus;

/// A status report for one job, from any source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Job identifier
    pub job_id: String,
    /// Message the job belongs to, when the sender knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Reported status
    pub status: JobStatus,
    /// Completion percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
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
    /// Conversation the job belongs to, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl JobUpdate {
    /// Update with only the required fields
    #[must_use]
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            message_id: None,
            status,
            progress: None,
            queue_position: None,
            image_url: None,
            error: None,
            conversation_id: None,
        }
    }

    /// Set the progress
    #[must_use]
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the target message
    #[must_use]
    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the result location
    #[must_use]
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Set the failure reason
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the queue position
    #[must_use]
    pub fn with_queue_position(mut self, position: u32) -> Self {
        self.queue_position = Some(position);
        self
    }
}

/// Where an update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Push channel frame
    Push,
    /// Polling fallback
    Poll,
    /// Streaming session
    Stream,
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Push => write!(f, "push"),
            UpdateSource::Poll => write!(f, "poll"),
            UpdateSource::Stream => write!(f, "stream"),
        }
    }
}

/// Why an update was not merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No local message carries the job yet
    NotFound,
    /// The job already reached this terminal status
    Terminal(JobStatus),
    /// The update ranks below the observed status
    OutOfOrder {
        /// Status already observed
        current: JobStatus,
        /// Status carried by the update
        incoming: JobStatus,
    },
    /// The message addressed by id carries a different job
    JobMismatch {
        /// Job id on the message
        current: String,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NotFound => write!(f, "message not found"),
            DropReason::Terminal(status) => write!(f, "job already {}", status),
            DropReason::OutOfOrder { current, incoming } => {
                write!(f, "out of order: {} after {}", incoming, current)
            }
            DropReason::JobMismatch { current } => {
                write!(f, "message carries job {}", current)
            }
        }
    }
}

/// Result of [`super::JobReconciler::apply_update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was merged
    Applied {
        /// Message that was updated
        message_id: String,
        /// Status after the merge
        status: JobStatus,
    },
    /// The update was ignored
    Dropped(DropReason),
}

impl ApplyOutcome {
    /// Whether the update changed the store
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}
