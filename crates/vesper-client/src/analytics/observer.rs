use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vesper_core::observer::{FaultReport, Notification, Observer, ObserverResult};

use super::client::Analytics;
use super::types::AnalyticsEvent;

/// Observer that turns fault reports and notifications into analytics events.
///
/// Observer callbacks are synchronous, so events travel over a channel to a
/// task that feeds the sink.
#[derive(Debug, Clone)]
pub struct AnalyticsObserver {
    tx: mpsc::UnboundedSender<AnalyticsEvent>,
}

impl AnalyticsObserver {
    /// Create the observer and the task forwarding into `analytics`.
    ///
    /// The task ends once every clone of the observer is dropped.
    pub fn spawn(analytics: Arc<Analytics>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                analytics.track(event).await;
            }
        });
        (Self { tx }, handle)
    }

    fn send(&self, event: AnalyticsEvent) -> ObserverResult {
        self.tx
            .send(event)
            .map_err(|_| "analytics task stopped".into())
    }
}

impl Observer for AnalyticsObserver {
    fn notify(&self, notification: &Notification) -> ObserverResult {
        let level = serde_json::to_value(notification.level)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.send(AnalyticsEvent::NotificationShown {
            level,
            title: notification.title.clone(),
            job_id: notification.job_id.clone(),
        })
    }

    fn report_fault(&self, fault: &FaultReport) -> ObserverResult {
        self.send(AnalyticsEvent::RequestFailed {
            endpoint: fault.endpoint.clone(),
            method: fault.method.clone(),
            status_code: fault.status_code,
            category: fault.category.clone(),
        })
    }
}
