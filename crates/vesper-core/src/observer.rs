//! Observer capability for side channels
//!
//! Breadcrumbs, user notifications and fault reports are handed to an
//! injected [`Observer`]. Callers go through [`ObserverHandle`], which
//! swallows observer errors and panics so a side channel can never change
//! the outcome of the operation being observed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Error type observers may return
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for observer callbacks
pub type ObserverResult = std::result::Result<(), ObserverError>;

/// Diagnostic trace event recorded alongside real operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breadcrumb {
    /// Area that emitted the breadcrumb (`http`, `stream`, `job`, `push`)
    pub category: String,
    /// Short description of what happened
    pub message: String,
    /// HTTP verb, for request breadcrumbs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path, for request breadcrumbs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HTTP status, when a response was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Attempt number (1-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// When the breadcrumb was recorded
    pub timestamp: DateTime<Utc>,
}

impl Breadcrumb {
    /// Create a breadcrumb
    #[must_use]
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            method: None,
            path: None,
            status: None,
            attempt: None,
            timestamp: Utc::now(),
        }
    }

    /// Breadcrumb describing an HTTP request
    #[must_use]
    pub fn http(method: &str, path: &str, message: impl Into<String>) -> Self {
        let mut crumb = Self::new("http", message);
        crumb.method = Some(method.to_string());
        crumb.path = Some(path.to_string());
        crumb
    }

    /// Attach a status code
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an attempt number
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Something finished well
    Success,
    /// Informational
    Info,
    /// Something failed
    Error,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Severity
    pub level: NotificationLevel,
    /// Short headline
    pub title: String,
    /// Optional detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Job this notification is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl Notification {
    /// Success notification
    #[must_use]
    pub fn success(title: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            title: title.into(),
            body: None,
            job_id: None,
        }
    }

    /// Error notification
    #[must_use]
    pub fn error(title: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            title: title.into(),
            body: None,
            job_id: None,
        }
    }

    /// Informational notification
    #[must_use]
    pub fn info(title: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            title: title.into(),
            body: None,
            job_id: None,
        }
    }

    /// Attach a body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a job id
    #[must_use]
    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Terminal failure handed to the fault-reporting side channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultReport {
    /// Rendered error
    pub error: String,
    /// Error category (`transient-network`, `permanent-auth`, ...)
    pub category: String,
    /// Endpoint path
    pub endpoint: String,
    /// HTTP verb
    pub method: String,
    /// HTTP status, when one was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Receiver of side-channel events.
///
/// Every method has a no-op default so implementations only override what
/// they care about.
pub trait Observer: Send + Sync {
    /// Record a breadcrumb
    fn breadcrumb(&self, _crumb: &Breadcrumb) -> ObserverResult {
        Ok(())
    }

    /// Show a notification to the user
    fn notify(&self, _notification: &Notification) -> ObserverResult {
        Ok(())
    }

    /// Report a terminal failure
    fn report_fault(&self, _fault: &FaultReport) -> ObserverResult {
        Ok(())
    }
}

/// Shared, failure-proof handle to an observer
#[derive(Clone)]
pub struct ObserverHandle {
    inner: Arc<dyn Observer>,
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").finish_non_exhaustive()
    }
}

impl ObserverHandle {
    /// Wrap an observer
    #[must_use]
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { inner: observer }
    }

    /// Handle that discards everything
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopObserver))
    }

    /// Record a breadcrumb
    pub fn breadcrumb(&self, crumb: Breadcrumb) {
        guarded("breadcrumb", || self.inner.breadcrumb(&crumb));
    }

    /// Show a notification
    pub fn notify(&self, notification: Notification) {
        guarded("notify", || self.inner.notify(&notification));
    }

    /// Report a terminal failure
    pub fn report_fault(&self, fault: FaultReport) {
        guarded("report_fault", || self.inner.report_fault(&fault));
    }
}

impl Default for ObserverHandle {
    fn default() -> Self {
        Self::noop()
    }
}

fn guarded<F>(channel: &'static str, f: F)
where
    F: FnOnce() -> ObserverResult,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(channel, error = %e, "Observer failed, ignoring"),
        Err(_) => warn!(channel, "Observer panicked, ignoring"),
    }
}

/// Observer that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Observer that writes everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn breadcrumb(&self, crumb: &Breadcrumb) -> ObserverResult {
        debug!(
            category = %crumb.category,
            method = crumb.method.as_deref().unwrap_or("-"),
            path = crumb.path.as_deref().unwrap_or("-"),
            status = crumb.status,
            attempt = crumb.attempt,
            "{}",
            crumb.message
        );
        Ok(())
    }

    fn notify(&self, notification: &Notification) -> ObserverResult {
        match notification.level {
            NotificationLevel::Error => error!(
                job_id = notification.job_id.as_deref(),
                body = notification.body.as_deref(),
                "{}",
                notification.title
            ),
            _ => info!(
                job_id = notification.job_id.as_deref(),
                body = notification.body.as_deref(),
                "{}",
                notification.title
            ),
        }
        Ok(())
    }

    fn report_fault(&self, fault: &FaultReport) -> ObserverResult {
        error!(
            endpoint = %fault.endpoint,
            method = %fault.method,
            status_code = fault.status_code,
            category = %fault.category,
            "Request failed: {}",
            fault.error
        );
        Ok(())
    }
}

/// Observer that forwards to several observers, each one guarded separately
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl FanoutObserver {
    /// Empty fanout
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for FanoutObserver {
    fn breadcrumb(&self, crumb: &Breadcrumb) -> ObserverResult {
        for observer in &self.observers {
            guarded("breadcrumb", || observer.breadcrumb(crumb));
        }
        Ok(())
    }

    fn notify(&self, notification: &Notification) -> ObserverResult {
        for observer in &self.observers {
            guarded("notify", || observer.notify(notification));
        }
        Ok(())
    }

    fn report_fault(&self, fault: &FaultReport) -> ObserverResult {
        for observer in &self.observers {
            guarded("report_fault", || observer.report_fault(fault));
        }
        Ok(())
    }
}

/// Observer that keeps everything in memory, for tests and inspection
#[derive(Debug, Default)]
pub struct RecordingObserver {
    breadcrumbs: Mutex<Vec<Breadcrumb>>,
    notifications: Mutex<Vec<Notification>>,
    faults: Mutex<Vec<FaultReport>>,
}

impl RecordingObserver {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded breadcrumbs
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.breadcrumbs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded notifications
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded fault reports
    pub fn faults(&self) -> Vec<FaultReport> {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Observer for RecordingObserver {
    fn breadcrumb(&self, crumb: &Breadcrumb) -> ObserverResult {
        self.breadcrumbs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(crumb.clone());
        Ok(())
    }

    fn notify(&self, notification: &Notification) -> ObserverResult {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }

    fn report_fault(&self, fault: &FaultReport) -> ObserverResult {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault.clone());
        Ok(())
    }
}
