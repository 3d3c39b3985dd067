//! Client configuration
//!
//! Every field has a default so a partial TOML file or a handful of
//! environment variables is enough to build a working client.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default server address
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default attempts per logical request
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-attempt timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default backoff base in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Default backoff ceiling in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default idle window for an open stream in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Response header carrying a newly minted conversation id
pub const DEFAULT_CONVERSATION_HEADER: &str = "x-conversation-id";

/// Default polling interval for job status in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default delay before a cancelled job's message disappears
pub const DEFAULT_CANCEL_REMOVAL_DELAY_MS: u64 = 400;

/// Default push reconnect budget
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default analytics batch size
pub const DEFAULT_ANALYTICS_BATCH_SIZE: usize = 20;

/// Default analytics flush interval in seconds (5 minutes)
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 300;

/// Top-level client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Server address and credentials
    #[serde(default)]
    pub server: ServerConfig,
    /// Request executor policy
    #[serde(default)]
    pub requests: RequestConfig,
    /// Streaming send settings
    #[serde(default)]
    pub stream: StreamConfig,
    /// Job polling and cancellation
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Push channel
    #[serde(default)]
    pub push: PushConfig,
    /// Analytics sink
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    /// Endpoint path templates
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

/// Server address and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL every endpoint path is joined to
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .filter(|token| !token.trim().is_empty())
        .map(SecretString::from))
}

/// Request executor policy
#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    /// Attempts per logical request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

/// Streaming send settings
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Idle window of an open stream in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Response header carrying a new conversation id
    #[serde(default = "default_conversation_header")]
    pub conversation_header: String,
    /// Timeout for receiving the response head of a send, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            conversation_header: default_conversation_header(),
            send_timeout_ms: default_timeout_ms(),
        }
    }
}

impl StreamConfig {
    /// Idle window as a duration
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Send head timeout as a duration
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_conversation_header() -> String {
    DEFAULT_CONVERSATION_HEADER.to_string()
}

/// Job polling and cancellation
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Polling interval in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay before a cancelled job's message is removed, in milliseconds
    #[serde(default = "default_cancel_removal_delay_ms")]
    pub cancel_removal_delay_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            cancel_removal_delay_ms: default_cancel_removal_delay_ms(),
        }
    }
}

impl JobsConfig {
    /// Polling interval as a duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Cancellation delay as a duration
    #[must_use]
    pub fn cancel_removal_delay(&self) -> Duration {
        Duration::from_millis(self.cancel_removal_delay_ms)
    }
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_cancel_removal_delay_ms() -> u64 {
    DEFAULT_CANCEL_REMOVAL_DELAY_MS
}

/// Push channel settings
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// WebSocket URL; the channel is disabled when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

/// Analytics sink settings
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    /// Whether events are collected at all
    #[serde(default)]
    pub enabled: bool,
    /// Collector URL; events are dropped after logging when unset
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Timer flush interval in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: None,
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_ANALYTICS_BATCH_SIZE
}

fn default_flush_interval() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

/// Endpoint path templates.
///
/// `{job_id}` and `{conversation_id}` are substituted at call time.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Streaming send
    #[serde(default = "default_send_path")]
    pub send: String,
    /// Job status lookup
    #[serde(default = "default_job_status_path")]
    pub job_status: String,
    /// Job cancellation
    #[serde(default = "default_job_cancel_path")]
    pub job_cancel: String,
    /// Conversation message list
    #[serde(default = "default_messages_path")]
    pub messages: String,
    /// Attachment upload
    #[serde(default = "default_upload_path")]
    pub upload: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            send: default_send_path(),
            job_status: default_job_status_path(),
            job_cancel: default_job_cancel_path(),
            messages: default_messages_path(),
            upload: default_upload_path(),
        }
    }
}

impl EndpointConfig {
    /// Status path for a job
    #[must_use]
    pub fn job_status_path(&self, job_id: &str) -> String {
        self.job_status.replace("{job_id}", job_id)
    }

    /// Cancel path for a job
    #[must_use]
    pub fn job_cancel_path(&self, job_id: &str) -> String {
        self.job_cancel.replace("{job_id}", job_id)
    }

    /// Message list path for a conversation
    #[must_use]
    pub fn messages_path(&self, conversation_id: &str) -> String {
        self.messages.replace("{conversation_id}", conversation_id)
    }
}

fn default_send_path() -> String {
    "/api/chat".to_string()
}

fn default_job_status_path() -> String {
    "/api/jobs/{job_id}".to_string()
}

fn default_job_cancel_path() -> String {
    "/api/jobs/{job_id}/cancel".to_string()
}

fn default_messages_path() -> String {
    "/api/conversations/{conversation_id}/messages".to_string()
}

fn default_upload_path() -> String {
    "/api/uploads".to_string()
}
