use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Lifecycle of one streaming send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in flight
    Idle,
    /// Uploading attachments and waiting for the response head
    Sending,
    /// Body is open, durable id not seen yet
    HandshakePending,
    /// Events are being applied
    Streaming,
    /// Stream ended normally, record being settled
    Finalizing,
    /// Send failed, error notice appended
    Failed,
}

impl SessionState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Sending => "sending",
            SessionState::HandshakePending => "handshake_pending",
            SessionState::Streaming => "streaming",
            SessionState::Finalizing => "finalizing",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the client's "sending" flag for the duration of one send.
///
/// Dropping the guard clears the flag and returns the state to `Idle`, on
/// every exit path.
pub struct SendingGuard {
    flag: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SendingGuard {
    /// Take the flag, or fail with [`Error::Busy`] if a send is in flight
    pub fn acquire(
        flag: &Arc<AtomicBool>,
        state: &Arc<watch::Sender<SessionState>>,
    ) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self {
            flag: Arc::clone(flag),
            state: Arc::clone(state),
        })
    }
}

impl Drop for SendingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.state.send_replace(SessionState::Idle);
    }
}

/// `[[image_job:<job_id>:<message_id>]]` left in text by older backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMarker {
    /// Job announced by the marker
    pub job_id: String,
    /// Message that will carry the job
    pub message_id: String,
}

fn marker_regex() -> Option<&'static Regex> {
    static MARKER_RE: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER_RE
        .get_or_init(|| Regex::new(r"\[\[image_job:([^:\]]+):([^\]]+)\]\]").ok())
        .as_ref()
}

impl LegacyMarker {
    /// First marker in `text`
    #[must_use]
    pub fn find(text: &str) -> Option<Self> {
        marker_regex()?.captures(text).map(|caps| Self {
            job_id: caps[1].trim().to_string(),
            message_id: caps[2].trim().to_string(),
        })
    }

    /// `text` with every marker removed
    #[must_use]
    pub fn strip(text: &str) -> String {
        match marker_regex() {
            Some(re) => re.replace_all(text, "").into_owned(),
            None => text.to_string(),
        }
    }
}

/// How a normally-ended stream is settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeDecision {
    /// Clear the streaming flag and keep the message
    Complete,
    /// Nothing usable arrived: drop the placeholder and recover
    Recover {
        /// Marker found in the accumulated text
        marker: Option<LegacyMarker>,
    },
}

impl FinalizeDecision {
    /// Recovery runs only when the stream ended normally without visible
    /// text, without a job and without an in-stream error. Legacy markers do
    /// not count as visible text.
    #[must_use]
    pub fn decide(content: &str, job_detected: bool, saw_error: bool) -> Self {
        if job_detected || saw_error {
            return Self::Complete;
        }
        if !LegacyMarker::strip(content).trim().is_empty() {
            return Self::Complete;
        }
        Self::Recover {
            marker: LegacyMarker::find(content),
        }
    }

    /// Whether this decision drops the placeholder
    #[must_use]
    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::Recover { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_parsing() {
        let marker = LegacyMarker::find("before [[image_job:J9:77]] after").unwrap();
        assert_eq!(marker.job_id, "J9");
        assert_eq!(marker.message_id, "77");
        assert_eq!(LegacyMarker::strip("a[[image_job:J9:77]]b"), "ab");
        assert!(LegacyMarker::find("[[image_job:J9]]").is_none());
    }

    #[test]
    fn test_finalize_predicate() {
        assert_eq!(FinalizeDecision::decide("Hello", false, false), FinalizeDecision::Complete);
        assert_eq!(FinalizeDecision::decide("", true, false), FinalizeDecision::Complete);
        assert_eq!(FinalizeDecision::decide("", false, true), FinalizeDecision::Complete);
        assert_eq!(
            FinalizeDecision::decide("  \n", false, false),
            FinalizeDecision::Recover { marker: None }
        );
        assert_eq!(
            FinalizeDecision::decide("[[image_job:J1:42]]\n", false, false),
            FinalizeDecision::Recover {
                marker: Some(LegacyMarker {
                    job_id: "J1".to_string(),
                    message_id: "42".to_string(),
                })
            }
        );
    }

    #[test]
    fn test_guard_rejects_second_send_and_resets() {
        let flag = Arc::new(AtomicBool::new(false));
        let (state, rx) = watch::channel(SessionState::Idle);
        let state = Arc::new(state);

        let guard = SendingGuard::acquire(&flag, &state).unwrap();
        state.send_replace(SessionState::Streaming);
        assert!(matches!(
            SendingGuard::acquire(&flag, &state),
            Err(Error::Busy)
        ));

        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(*rx.borrow(), SessionState::Idle);
        assert!(SendingGuard::acquire(&flag, &state).is_ok());
    }
}
