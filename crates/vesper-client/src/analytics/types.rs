use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Analytics event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// A request failed for good
    RequestFailed {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// Status code, when a response arrived
        status_code: Option<u16>,
        /// Error category (transient-network, permanent-auth, ...)
        category: String,
    },

    /// A notification was shown
    NotificationShown {
        /// success, info or error
        level: String,
        /// Headline
        title: String,
        /// Related job
        job_id: Option<String>,
    },

    /// A streaming send finished
    SendCompleted {
        /// Wall time of the whole send
        duration_ms: u64,
        /// Whether it ended without error
        success: bool,
    },

    /// Anything else
    Custom {
        /// Event name
        name: String,
        /// Free-form payload
        properties: Value,
    },
}

/// Queued event with its envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    /// When the event was tracked
    pub timestamp: DateTime<Utc>,
    /// Random id shared by every event of one process
    pub session_id: String,
    /// The event
    #[serde(flatten)]
    pub event: AnalyticsEvent,
}
