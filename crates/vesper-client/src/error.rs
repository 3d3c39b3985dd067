//! Error types for vesper-client
//!
//! Every failure the client can surface, grouped into the categories the
//! retry policy and the fault reporter care about.

use std::fmt;
use thiserror::Error;

/// Client error type
#[derive(Debug, Error)]
pub enum Error {
    /// Every attempt timed out
    #[error("{method} {endpoint} timed out after {attempts} attempt(s) of {timeout_ms}ms")]
    Timeout {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// Per-attempt timeout
        timeout_ms: u64,
        /// Attempts made
        attempts: u32,
    },

    /// HTTP 429 on the last attempt
    #[error("{method} {endpoint} rate limited after {attempts} attempt(s)")]
    RateLimited {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// Attempts made
        attempts: u32,
    },

    /// HTTP 5xx on the last attempt
    #[error("{method} {endpoint} failed with {status} after {attempts} attempt(s)")]
    Server {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// HTTP status
        status: u16,
        /// Attempts made
        attempts: u32,
    },

    /// HTTP 401, never retried
    #[error("{method} {endpoint} unauthorized")]
    Unauthorized {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
    },

    /// Any other non-2xx status
    #[error("{method} {endpoint} failed with {status}: {message}")]
    Api {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// HTTP status
        status: u16,
        /// Message taken from the error body
        message: String,
    },

    /// 2xx with nothing in the body
    #[error("empty response from {method} {endpoint}")]
    EmptyResponse {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
    },

    /// 2xx whose body is not the expected JSON
    #[error("malformed response from {method} {endpoint}: {reason}")]
    MalformedResponse {
        /// Endpoint path
        endpoint: String,
        /// HTTP verb
        method: String,
        /// Parser message
        reason: String,
    },

    /// Connection could not be established or was reset
    #[error("network error: {0}")]
    Network(String),

    /// No forward progress within the idle window of an open stream
    #[error("stream stalled for {0}s")]
    StreamTimeout(u64),

    /// Read error inside an open stream
    #[error("stream error: {0}")]
    Stream(String),

    /// Attachment upload failed
    #[error("upload failed: {0}")]
    Upload(String),

    /// Push channel connection failure
    #[error("push channel error: {0}")]
    PushChannel(String),

    /// The backend refused to cancel a job
    #[error("cancel of job {job_id} rejected: {message}")]
    CancelRejected {
        /// Job that was not cancelled
        job_id: String,
        /// Backend explanation
        message: String,
    },

    /// Another send is still in flight
    #[error("a message is already being sent")]
    Busy,

    /// Store or reconciler error
    #[error("core error: {0}")]
    Core(#[from] vesper_core::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure category, used for retry decisions and fault reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Timeouts, 5xx, 429 and dropped connections
    TransientNetwork,
    /// 401
    PermanentAuth,
    /// Empty or unparsable bodies
    MalformedResponse,
    /// Other 4xx, upload and push failures
    Client,
    /// Local state errors
    Internal,
}

impl ErrorCategory {
    /// Stable name used in fault reports
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::TransientNetwork => "transient-network",
            ErrorCategory::PermanentAuth => "permanent-auth",
            ErrorCategory::MalformedResponse => "malformed-response",
            ErrorCategory::Client => "client",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// HTTP status carried by the error, if any
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::RateLimited { .. } => Some(429),
            Error::Server { status, .. } | Error::Api { status, .. } => Some(*status),
            Error::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    /// Category of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Timeout { .. }
            | Error::RateLimited { .. }
            | Error::Server { .. }
            | Error::Network(_)
            | Error::StreamTimeout(_)
            | Error::Stream(_) => ErrorCategory::TransientNetwork,
            Error::Unauthorized { .. } => ErrorCategory::PermanentAuth,
            Error::EmptyResponse { .. } | Error::MalformedResponse { .. } => {
                ErrorCategory::MalformedResponse
            }
            Error::Api { .. }
            | Error::Upload(_)
            | Error::PushChannel(_)
            | Error::CancelRejected { .. }
            | Error::Busy => ErrorCategory::Client,
            Error::Core(_) => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::TransientNetwork
    }

    /// Human-readable text appended to the conversation on failure
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Error::Timeout { .. } => {
                "⏱️ The server took too long to respond. Please try again.".to_string()
            }
            Error::RateLimited { .. } => {
                "⏳ Too many requests. Please wait a moment and try again.".to_string()
            }
            Error::Server { .. } => {
                "🛠️ The server ran into a problem. Please try again shortly.".to_string()
            }
            Error::Unauthorized { .. } => {
                "🔑 Your session is not authorized. Please sign in again.".to_string()
            }
            Error::Api { message, .. } => format!("❌ Request failed: {}", message),
            Error::EmptyResponse { .. } | Error::MalformedResponse { .. } => {
                "❌ The server sent a response that could not be read.".to_string()
            }
            Error::Network(_) => "🌐 Network connection problem.".to_string(),
            Error::StreamTimeout(_) => {
                "⏱️ The response stopped arriving. Please try again.".to_string()
            }
            Error::Stream(_) => "🌐 The response was interrupted.".to_string(),
            Error::Upload(msg) => format!("📎 Attachment upload failed: {}", msg),
            Error::PushChannel(_) => "🔌 Live updates are unavailable.".to_string(),
            Error::CancelRejected { message, .. } if message.is_empty() => {
                "⚠️ The job could not be cancelled.".to_string()
            }
            Error::CancelRejected { message, .. } => {
                format!("⚠️ The job could not be cancelled: {}", message)
            }
            Error::Busy => "✋ Please wait for the current reply to finish.".to_string(),
            Error::Core(e) => format!("❌ Internal error: {}", e),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let auth = Error::Unauthorized {
            endpoint: "/chat".to_string(),
            method: "POST".to_string(),
        };
        assert_eq!(auth.category(), ErrorCategory::PermanentAuth);
        assert!(!auth.is_transient());
        assert_eq!(auth.status_code(), Some(401));

        let server = Error::Server {
            endpoint: "/chat".to_string(),
            method: "POST".to_string(),
            status: 503,
            attempts: 3,
        };
        assert!(server.is_transient());
        assert_eq!(server.status_code(), Some(503));
        assert_eq!(server.category().as_str(), "transient-network");

        assert_eq!(
            Error::EmptyResponse {
                endpoint: "/x".to_string(),
                method: "GET".to_string()
            }
            .category(),
            ErrorCategory::MalformedResponse
        );
    }

    #[test]
    fn test_user_message_carries_api_detail() {
        let err = Error::Api {
            endpoint: "/chat".to_string(),
            method: "POST".to_string(),
            status: 422,
            message: "message too long".to_string(),
        };
        assert!(err.user_message().contains("message too long"));
        assert_eq!(err.status_code(), Some(422));
    }
}
