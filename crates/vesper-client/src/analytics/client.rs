use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{AnalyticsEvent, AnalyticsRecord};
use crate::config::AnalyticsConfig;
use crate::transport::{HttpRequest, Transport};

/// Maximum queue size to prevent unbounded memory growth
pub const MAX_QUEUE_SIZE: usize = 1000;

/// HTTP request timeout in seconds
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Analytics sink
pub struct Analytics {
    config: AnalyticsConfig,
    transport: Arc<dyn Transport>,
    enabled: AtomicBool,
    session_id: String,
    event_queue: RwLock<Vec<AnalyticsRecord>>,
}

impl std::fmt::Debug for Analytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analytics")
            .field("enabled", &self.is_enabled())
            .field("endpoint_url", &self.config.endpoint_url)
            .field("batch_size", &self.config.batch_size)
            .finish_non_exhaustive()
    }
}

impl Analytics {
    /// Create a sink that posts through `transport`
    pub fn new(config: AnalyticsConfig, transport: Arc<dyn Transport>) -> Self {
        let enabled = config.enabled;
        if enabled {
            info!(endpoint = config.endpoint_url.as_deref().unwrap_or("-"), "Analytics enabled");
        } else {
            debug!("Analytics disabled");
        }

        Self {
            config,
            transport,
            enabled: AtomicBool::new(enabled),
            session_id: Uuid::new_v4().to_string(),
            event_queue: RwLock::new(Vec::new()),
        }
    }

    /// Check if analytics is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable collection; disabling drops queued events
    pub async fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.event_queue.write().await.clear();
        }
    }

    /// Number of events waiting for a flush
    pub async fn queued(&self) -> usize {
        self.event_queue.read().await.len()
    }

    /// Track an event
    pub async fn track(&self, event: AnalyticsEvent) {
        if !self.is_enabled() {
            return;
        }

        let record = AnalyticsRecord {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            event,
        };

        let should_flush = {
            let mut queue = self.event_queue.write().await;
            if queue.len() >= MAX_QUEUE_SIZE {
                queue.remove(0);
            }
            queue.push(record);
            queue.len() >= self.config.batch_size.max(1)
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Flush pending events to the collector
    pub async fn flush(&self) {
        if !self.is_enabled() {
            return;
        }

        let events = self.drain_queue().await;
        if events.is_empty() {
            return;
        }

        let Some(endpoint) = self.config.endpoint_url.clone() else {
            debug!(count = events.len(), "Analytics: no endpoint configured, dropping events");
            return;
        };

        match self.send_events(&endpoint, &events).await {
            Ok(()) => debug!(count = events.len(), "Analytics: sent events"),
            Err(e) => {
                warn!(error = %e, count = events.len(), "Analytics: failed to send events");
                self.requeue_events(events).await;
            }
        }
    }

    /// Flush on a timer until `cancel` fires, then flush once more
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let analytics = Arc::clone(self);
        let period = Duration::from_secs(self.config.flush_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => analytics.flush().await,
                }
            }
            analytics.flush().await;
        })
    }

    /// Teardown flush
    pub async fn shutdown(&self) {
        self.flush().await;
        let left = self.queued().await;
        if left > 0 {
            warn!(count = left, "Analytics: events left unsent at shutdown");
        }
    }

    async fn drain_queue(&self) -> Vec<AnalyticsRecord> {
        let mut queue = self.event_queue.write().await;
        queue.drain(..).collect()
    }

    /// Put a failed batch back in front of newer events, within the size limit
    async fn requeue_events(&self, events: Vec<AnalyticsRecord>) {
        let mut queue = self.event_queue.write().await;
        let room = MAX_QUEUE_SIZE.saturating_sub(queue.len());
        if events.len() > room {
            warn!(dropped = events.len() - room, "Analytics: queue full, dropping events");
        }
        let kept: Vec<AnalyticsRecord> = events.into_iter().take(room).collect();
        queue.splice(0..0, kept);
    }

    async fn send_events(&self, endpoint: &str, events: &[AnalyticsRecord]) -> Result<(), String> {
        let body = serde_json::to_value(events).map_err(|e| e.to_string())?;
        let request = HttpRequest::post(endpoint, body);

        let response = tokio::time::timeout(
            Duration::from_secs(HTTP_TIMEOUT_SECS),
            self.transport.send(request),
        )
        .await
        .map_err(|_| format!("timed out after {HTTP_TIMEOUT_SECS}s"))?
        .map_err(|e| e.to_string())?;

        if response.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status))
        }
    }
}
